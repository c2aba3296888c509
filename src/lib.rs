//! MetroFlow Rust Library
//!
//! Punto de entrada del workspace:
//! - `config`: configuración de aplicación cargada desde el entorno.
//! - `errors`: error de aplicación que agrupa core y persistencia.
//!
//! Re-exporta los crates del workspace para clientes que sólo dependen de
//! este.

pub mod config;
pub mod errors;

pub use errors::AppError;
pub use metro_core;
pub use metro_domain;
pub use metro_persistence;
