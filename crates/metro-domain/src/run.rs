//! Corridas de medición y registros de paso.
//!
//! Una `MeasurementRun` es una instancia de un programa; cada `StepRecord`
//! es un chequeo ejecutado dentro de la corrida y guarda el valor medido y
//! su estado de completitud.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DomainError;

/// Estado de un registro de paso.
///
/// Inicia en `Pending` y avanza a `Done`. El valor heredado `"InProgress"`
/// se acepta como alias de `Pending` al deserializar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StepStatus {
    #[default]
    #[serde(alias = "InProgress")]
    Pending,
    Done,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Done => "Done",
        }
    }

    /// Transición hacia adelante: re-aplicar el mismo estado siempre es
    /// válido; `Done -> Pending` no lo es.
    pub fn can_advance_to(self, next: StepStatus) -> bool {
        !matches!((self, next), (StepStatus::Done, StepStatus::Pending))
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "inprogress" => Ok(StepStatus::Pending),
            "done" => Ok(StepStatus::Done),
            _ => Err(DomainError::UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRun {
    pub id: i64,
    pub program_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Registro de un paso ejecutado. Instrumento, operador, límites, unidad y
/// `step_fingerprint` son una fotografía tomada al instanciar la corrida y no
/// siguen ediciones posteriores de la plantilla.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub id: i64,
    #[serde(alias = "measurmentId")]
    pub measurement_run_id: i64,
    pub measurement_program_step_id: i64,
    pub instrument_id: i64,
    pub operator_id: i64,
    #[serde(default)]
    pub real_value: f64,
    #[serde(default)]
    pub status: StepStatus,
    pub lsl: f64,
    pub target_value: f64,
    pub usl: f64,
    pub measurement_unit_id: i64,
    pub step_fingerprint: String,
}

impl StepRecord {
    /// `true` si `value` cae dentro de los límites vigentes al instanciar.
    pub fn accepts(&self, value: f64) -> bool {
        self.lsl <= value && value <= self.usl
    }
}

/// Borrador de registro armado por el instanciador antes de la inserción en
/// lote. La corrida la asigna el store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecordDraft {
    pub measurement_program_step_id: i64,
    pub instrument_id: i64,
    pub operator_id: i64,
    pub real_value: f64,
    pub status: StepStatus,
    pub lsl: f64,
    pub target_value: f64,
    pub usl: f64,
    pub measurement_unit_id: i64,
    pub step_fingerprint: String,
}

impl StepRecordDraft {
    pub fn into_record(self, id: i64, run_id: i64) -> StepRecord {
        StepRecord { id,
                     measurement_run_id: run_id,
                     measurement_program_step_id: self.measurement_program_step_id,
                     instrument_id: self.instrument_id,
                     operator_id: self.operator_id,
                     real_value: self.real_value,
                     status: self.status,
                     lsl: self.lsl,
                     target_value: self.target_value,
                     usl: self.usl,
                     measurement_unit_id: self.measurement_unit_id,
                     step_fingerprint: self.step_fingerprint }
    }
}

/// Actualización parcial de un registro: los campos `None` no se tocan.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecordPatch {
    pub real_value: Option<f64>,
    pub status: Option<StepStatus>,
}

impl StepRecordPatch {
    pub fn is_empty(&self) -> bool {
        self.real_value.is_none() && self.status.is_none()
    }

    /// Aplica el parche sobre `record`. Aplicarlo dos veces deja el mismo
    /// resultado que aplicarlo una.
    pub fn apply_to(&self, record: &mut StepRecord) {
        if let Some(value) = self.real_value {
            record.real_value = value;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
    }
}
