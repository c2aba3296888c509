//! metro-core: instanciación de programas y ciclo de vida de registros de paso
pub mod catalog;
pub mod config;
pub mod errors;
pub mod hashing;
pub mod identity;
pub mod instantiate;
pub mod records;
pub mod repo;
pub mod validation;

use std::sync::Arc;

pub use catalog::{ProgramDetail, TemplateCatalog};
pub use config::{CoreConfig, StatusPolicy};
pub use errors::{CoreError, EntityKind};
pub use identity::{IdentityProvider, IdentityResolver, StaticIdentity};
pub use instantiate::{BindingDrift, DriftKind, InstantiatedRun, RunInstantiator};
pub use records::{RunSheet, RunSheetRow, StepRecordStore};
#[cfg(any(test, feature = "testing"))]
pub use repo::FailPoint;
pub use repo::{DependencyTarget, InMemoryRepository, MetrologyRepository, ProgramUpsert};
pub use validation::{field_bag, FieldBag, ReferenceSnapshot, ReferentialValidator};

/// Los servicios del core sobre un mismo repositorio y configuración.
pub struct Metrology<R: MetrologyRepository> {
    pub catalog: TemplateCatalog<R>,
    pub runs: RunInstantiator<R>,
    pub records: StepRecordStore<R>,
    pub identity: IdentityResolver<R>,
}

impl<R: MetrologyRepository> Metrology<R> {
    pub fn new(repo: Arc<R>, config: &CoreConfig) -> Self {
        Self { catalog: TemplateCatalog::new(repo.clone(), config),
               runs: RunInstantiator::new(repo.clone(), config),
               records: StepRecordStore::new(repo.clone(), config),
               identity: IdentityResolver::new(repo, config.enforce_certification) }
    }
}
