//! Error de nivel aplicación: agrupa los errores de los crates del workspace
//! para los binarios y clientes de la librería.
use thiserror::Error;

use metro_core::CoreError;
use metro_persistence::PersistenceError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Error de persistencia: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Error de configuración: {0}")]
    Config(String),
    #[error("Error en IO: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Código de salida para binarios: 4 rechazo del dominio, 5 store o
    /// entorno.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Core(CoreError::Persistence(_)) => 5,
            AppError::Core(_) => 4,
            _ => 5,
        }
    }
}
