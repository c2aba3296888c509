//! metro-persistence
//!
//! Backend Postgres (Diesel) del contrato `MetrologyRepository` más
//! utilidades de conexión y migraciones.
//!
//! Módulos:
//! - `pg`: `PgRepository`, pool r2d2 y proveedores de conexión.
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración desde .env.
//! - `schema`: tablas Diesel declaradas para compilar queries.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, repository_from_env, ConnectionProvider, PgPool, PgRepository,
             PoolProvider};
