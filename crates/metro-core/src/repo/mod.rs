pub mod memory;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub use memory::FailPoint;
pub use memory::InMemoryRepository;
pub use types::{insert_run_then_records, DependencyTarget, MetrologyRepository, ProgramUpsert};
