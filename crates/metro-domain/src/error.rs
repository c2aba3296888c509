use thiserror::Error;

/// Error personalizado del dominio de metrología
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("Error de validación: {0}")]
    ValidationError(String),

    #[error("Estado de paso desconocido: {0}")]
    UnknownStatus(String),
}
