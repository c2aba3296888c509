//! Taxonomía de errores del core.
//!
//! Todas las variantes se entregan al llamador como fallas tipadas; ninguna
//! se reintenta internamente.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use metro_domain::StepStatus;

/// Entidad a la que apunta un `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Program,
    ProgramStep,
    Instrument,
    Unit,
    Operator,
    Run,
    StepRecord,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Program => "MeasurementProgram",
            EntityKind::ProgramStep => "MeasurementProgramStep",
            EntityKind::Instrument => "Instrument",
            EntityKind::Unit => "MeasurementUnit",
            EntityKind::Operator => "Operator",
            EntityKind::Run => "Measurement",
            EntityKind::StepRecord => "MeasurementStep",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Clone, Serialize, Deserialize)]
pub enum CoreError {
    #[error("{entity} no encontrado: {key}")]
    NotFound { entity: EntityKind, key: String },
    #[error("campo `{field}` inválido: {reason}")]
    Validation { field: String, reason: String },
    #[error("referencia `{field}`={id} rechazada: {reason}")]
    Referential { field: String, id: i64, reason: String },
    #[error("sin autorización: {0}")]
    Authorization(String),
    #[error("error de persistencia: {0}")]
    Persistence(String),
}

impl CoreError {
    pub fn not_found(entity: EntityKind, key: impl ToString) -> Self {
        Self::NotFound { entity, key: key.to_string() }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), reason: reason.into() }
    }

    /// Clave foránea que no resuelve a una fila existente.
    pub fn unresolved(field: impl Into<String>, id: i64) -> Self {
        Self::Referential { field: field.into(),
                            id,
                            reason: "no existe".to_string() }
    }

    /// Fila que no puede borrarse porque otras la siguen referenciando.
    pub fn still_referenced(field: impl Into<String>, id: i64, dependents: u64) -> Self {
        Self::Referential { field: field.into(),
                            id,
                            reason: format!("sigue referenciado por {dependents} fila(s)") }
    }

    /// Cambio de estado rechazado por la política `ForwardOnly`.
    pub fn illegal_transition(from: StepStatus, to: StepStatus) -> Self {
        Self::validation("status", format!("transición {from} -> {to} no permitida"))
    }

    pub fn is_not_found(&self, entity: EntityKind) -> bool {
        matches!(self, CoreError::NotFound { entity: e, .. } if *e == entity)
    }
}
