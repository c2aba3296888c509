use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Dispositivo físico de medición con sus propios metadatos de calibración.
/// Independiente de cualquier programa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub id: i64,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub accuracy: f64,
    pub resolution: f64,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub measurement_unit_id: i64,
    pub location: String,
    pub calibration_date: NaiveDate,
    pub verification_date: NaiveDate,
    pub verification_due_date: NaiveDate,
    pub notes: Option<String>,
}

/// Campos de un instrumento sin id (alta y modificación).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentDefinition {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub accuracy: f64,
    pub resolution: f64,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub measurement_unit_id: i64,
    pub location: String,
    pub calibration_date: NaiveDate,
    pub verification_date: NaiveDate,
    pub verification_due_date: NaiveDate,
    pub notes: Option<String>,
}

impl InstrumentDefinition {
    pub fn into_instrument(self, id: i64) -> Instrument {
        Instrument { id,
                     name: self.name,
                     manufacturer: self.manufacturer,
                     model: self.model,
                     serial_number: self.serial_number,
                     accuracy: self.accuracy,
                     resolution: self.resolution,
                     lower_limit: self.lower_limit,
                     upper_limit: self.upper_limit,
                     measurement_unit_id: self.measurement_unit_id,
                     location: self.location,
                     calibration_date: self.calibration_date,
                     verification_date: self.verification_date,
                     verification_due_date: self.verification_due_date,
                     notes: self.notes }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementUnit {
    pub id: i64,
    pub name: String,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub name: String,
    pub symbol: String,
}

impl UnitDefinition {
    pub fn into_unit(self, id: i64) -> MeasurementUnit {
        MeasurementUnit { id, name: self.name, symbol: self.symbol }
    }
}
