// program.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DomainError;

/// Plantilla reutilizable de medición. Es dueña de cero o más `ProgramStep`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementProgram {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Campos editables de un programa (alta y modificación).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramFields {
    pub name: String,
    pub description: Option<String>,
}

/// Un chequeo dentro de un programa: límites de tolerancia más el par
/// instrumento/unidad con el que se mide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStep {
    pub id: i64,
    pub program_id: i64,
    pub order: i32,
    pub name: String,
    pub description: Option<String>,
    pub lsl: f64,
    pub target_value: f64,
    pub usl: f64,
    pub measurement_unit_id: i64,
    pub instrument_id: i64,
}

impl ProgramStep {
    /// Definición (sin id) que originó este paso.
    pub fn definition(&self) -> ProgramStepDefinition {
        ProgramStepDefinition { program_id: self.program_id,
                                order: self.order,
                                name: self.name.clone(),
                                description: self.description.clone(),
                                lsl: self.lsl,
                                target_value: self.target_value,
                                usl: self.usl,
                                measurement_unit_id: self.measurement_unit_id,
                                instrument_id: self.instrument_id }
    }

    /// `true` si `value` cae dentro de `[lsl, usl]` (ambos inclusive).
    pub fn accepts(&self, value: f64) -> bool {
        self.lsl <= value && value <= self.usl
    }
}

/// Definición validada de un paso, lista para insertarse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStepDefinition {
    pub program_id: i64,
    pub order: i32,
    pub name: String,
    pub description: Option<String>,
    pub lsl: f64,
    pub target_value: f64,
    pub usl: f64,
    pub measurement_unit_id: i64,
    pub instrument_id: i64,
}

impl ProgramStepDefinition {
    /// Verifica `lsl <= targetValue <= usl`.
    ///
    /// # Errores
    /// Retorna `DomainError::ValidationError` si los límites están invertidos
    /// o el valor nominal queda fuera de ellos.
    pub fn check_tolerance_order(&self) -> Result<(), DomainError> {
        if self.lsl <= self.target_value && self.target_value <= self.usl {
            return Ok(());
        }
        Err(DomainError::ValidationError(format!("se espera lsl <= targetValue <= usl (lsl={}, targetValue={}, usl={})",
                                                 self.lsl, self.target_value, self.usl)))
    }

    pub fn into_step(self, id: i64) -> ProgramStep {
        ProgramStep { id,
                      program_id: self.program_id,
                      order: self.order,
                      name: self.name,
                      description: self.description,
                      lsl: self.lsl,
                      target_value: self.target_value,
                      usl: self.usl,
                      measurement_unit_id: self.measurement_unit_id,
                      instrument_id: self.instrument_id }
    }
}
