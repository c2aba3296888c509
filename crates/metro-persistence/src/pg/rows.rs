//! Filas Diesel y su mapeo hacia/desde las entidades de `metro-domain`.
//!
//! Las filas de lectura derivan `Selectable` y se cargan con `as_select()` /
//! `as_returning()`, de modo que el orden de columnas de la tabla no importa.
//! Los changesets de reemplazo usan `treat_none_as_null` para que un campo
//! opcional vacío borre el valor previo.
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use metro_domain::{Instrument, InstrumentDefinition, MeasurementProgram, MeasurementRun, MeasurementUnit, Operator,
                   OperatorRegistration, ProgramFields, ProgramStep, ProgramStepDefinition, StepRecord,
                   StepRecordDraft, StepRecordPatch, StepStatus, UnitDefinition};

use crate::error::PersistenceError;
use crate::schema::{instruments, measurement_programs, measurement_runs, measurement_units, operators, program_steps,
                    step_records};

// ---------------- programas ----------------

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = measurement_programs)]
pub struct ProgramRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProgramRow> for MeasurementProgram {
    fn from(r: ProgramRow) -> Self {
        MeasurementProgram { id: r.id,
                             name: r.name,
                             description: r.description,
                             created_at: r.created_at,
                             updated_at: r.updated_at }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = measurement_programs)]
pub struct NewProgramRow<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(AsChangeset, Debug)]
#[diesel(table_name = measurement_programs, treat_none_as_null = true)]
pub struct ProgramChanges<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub updated_at: DateTime<Utc>,
}

impl<'a> ProgramChanges<'a> {
    pub fn new(fields: &'a ProgramFields, updated_at: DateTime<Utc>) -> Self {
        Self { name: &fields.name,
               description: fields.description.as_deref(),
               updated_at }
    }
}

// ---------------- unidades ----------------

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = measurement_units)]
pub struct UnitRow {
    pub id: i64,
    pub name: String,
    pub symbol: String,
}

impl From<UnitRow> for MeasurementUnit {
    fn from(r: UnitRow) -> Self {
        MeasurementUnit { id: r.id, name: r.name, symbol: r.symbol }
    }
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = measurement_units)]
pub struct UnitValues<'a> {
    pub name: &'a str,
    pub symbol: &'a str,
}

impl<'a> From<&'a UnitDefinition> for UnitValues<'a> {
    fn from(d: &'a UnitDefinition) -> Self {
        Self { name: &d.name, symbol: &d.symbol }
    }
}

// ---------------- instrumentos ----------------

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = instruments)]
pub struct InstrumentRow {
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

impl From<InstrumentRow> for Instrument {
    fn from(r: InstrumentRow) -> Self {
        Instrument { id: r.id,
                     name: r.name,
                     manufacturer: r.manufacturer,
                     model: r.model,
                     serial_number: r.serial_number,
                     accuracy: r.accuracy,
                     resolution: r.resolution,
                     lower_limit: r.lower_limit,
                     upper_limit: r.upper_limit,
                     measurement_unit_id: r.measurement_unit_id,
                     location: r.location,
                     calibration_date: r.calibration_date,
                     verification_date: r.verification_date,
                     verification_due_date: r.verification_due_date,
                     notes: r.notes }
    }
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = instruments, treat_none_as_null = true)]
pub struct InstrumentValues<'a> {
    pub name: &'a str,
    pub manufacturer: &'a str,
    pub model: &'a str,
    pub serial_number: &'a str,
    pub accuracy: f64,
    pub resolution: f64,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub measurement_unit_id: i64,
    pub location: &'a str,
    pub calibration_date: NaiveDate,
    pub verification_date: NaiveDate,
    pub verification_due_date: NaiveDate,
    pub notes: Option<&'a str>,
}

impl<'a> From<&'a InstrumentDefinition> for InstrumentValues<'a> {
    fn from(d: &'a InstrumentDefinition) -> Self {
        Self { name: &d.name,
               manufacturer: &d.manufacturer,
               model: &d.model,
               serial_number: &d.serial_number,
               accuracy: d.accuracy,
               resolution: d.resolution,
               lower_limit: d.lower_limit,
               upper_limit: d.upper_limit,
               measurement_unit_id: d.measurement_unit_id,
               location: &d.location,
               calibration_date: d.calibration_date,
               verification_date: d.verification_date,
               verification_due_date: d.verification_due_date,
               notes: d.notes.as_deref() }
    }
}

// ---------------- pasos de programa ----------------

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = program_steps)]
pub struct StepRow {
    pub id: i64,
    pub program_id: i64,
    pub step_order: i32,
    pub name: String,
    pub description: Option<String>,
    pub lsl: f64,
    pub target_value: f64,
    pub usl: f64,
    pub measurement_unit_id: i64,
    pub instrument_id: i64,
}

impl From<StepRow> for ProgramStep {
    fn from(r: StepRow) -> Self {
        ProgramStep { id: r.id,
                      program_id: r.program_id,
                      order: r.step_order,
                      name: r.name,
                      description: r.description,
                      lsl: r.lsl,
                      target_value: r.target_value,
                      usl: r.usl,
                      measurement_unit_id: r.measurement_unit_id,
                      instrument_id: r.instrument_id }
    }
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = program_steps, treat_none_as_null = true)]
pub struct StepValues<'a> {
    pub program_id: i64,
    pub step_order: i32,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub lsl: f64,
    pub target_value: f64,
    pub usl: f64,
    pub measurement_unit_id: i64,
    pub instrument_id: i64,
}

impl<'a> From<&'a ProgramStepDefinition> for StepValues<'a> {
    fn from(d: &'a ProgramStepDefinition) -> Self {
        Self { program_id: d.program_id,
               step_order: d.order,
               name: &d.name,
               description: d.description.as_deref(),
               lsl: d.lsl,
               target_value: d.target_value,
               usl: d.usl,
               measurement_unit_id: d.measurement_unit_id,
               instrument_id: d.instrument_id }
    }
}

// ---------------- operadores ----------------

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = operators)]
pub struct OperatorRow {
    pub id: i64,
    pub user_id: Uuid,
    pub certification_number: String,
    pub certification_date: NaiveDate,
    pub certification_expiry_date: NaiveDate,
}

impl From<OperatorRow> for Operator {
    fn from(r: OperatorRow) -> Self {
        Operator { id: r.id,
                   user_id: r.user_id,
                   certification_number: r.certification_number,
                   certification_date: r.certification_date,
                   certification_expiry_date: r.certification_expiry_date }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = operators)]
pub struct NewOperatorRow<'a> {
    pub user_id: Uuid,
    pub certification_number: &'a str,
    pub certification_date: NaiveDate,
    pub certification_expiry_date: NaiveDate,
}

impl<'a> From<&'a OperatorRegistration> for NewOperatorRow<'a> {
    fn from(r: &'a OperatorRegistration) -> Self {
        Self { user_id: r.user_id,
               certification_number: &r.certification_number,
               certification_date: r.certification_date,
               certification_expiry_date: r.certification_expiry_date }
    }
}

// ---------------- corridas ----------------

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = measurement_runs)]
pub struct RunRow {
    pub id: i64,
    pub program_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<RunRow> for MeasurementRun {
    fn from(r: RunRow) -> Self {
        MeasurementRun { id: r.id,
                         program_id: r.program_id,
                         started_at: r.started_at,
                         finished_at: r.finished_at }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = measurement_runs)]
pub struct NewRunRow {
    pub program_id: i64,
    pub started_at: DateTime<Utc>,
}

// ---------------- registros de paso ----------------

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = step_records)]
pub struct RecordRow {
    pub id: i64,
    pub measurement_run_id: i64,
    pub measurement_program_step_id: i64,
    pub instrument_id: i64,
    pub operator_id: i64,
    pub real_value: f64,
    pub status: String,
    pub lsl: f64,
    pub target_value: f64,
    pub usl: f64,
    pub measurement_unit_id: i64,
    pub step_fingerprint: String,
}

impl TryFrom<RecordRow> for StepRecord {
    type Error = PersistenceError;

    fn try_from(r: RecordRow) -> Result<Self, Self::Error> {
        let status = r.status
                      .parse::<StepStatus>()
                      .map_err(|e| PersistenceError::Unknown(format!("step_records.status id={}: {e}", r.id)))?;
        Ok(StepRecord { id: r.id,
                        measurement_run_id: r.measurement_run_id,
                        measurement_program_step_id: r.measurement_program_step_id,
                        instrument_id: r.instrument_id,
                        operator_id: r.operator_id,
                        real_value: r.real_value,
                        status,
                        lsl: r.lsl,
                        target_value: r.target_value,
                        usl: r.usl,
                        measurement_unit_id: r.measurement_unit_id,
                        step_fingerprint: r.step_fingerprint })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = step_records)]
pub struct NewRecordRow<'a> {
    pub measurement_run_id: i64,
    pub measurement_program_step_id: i64,
    pub instrument_id: i64,
    pub operator_id: i64,
    pub real_value: f64,
    pub status: &'static str,
    pub lsl: f64,
    pub target_value: f64,
    pub usl: f64,
    pub measurement_unit_id: i64,
    pub step_fingerprint: &'a str,
}

impl<'a> NewRecordRow<'a> {
    pub fn new(run_id: i64, d: &'a StepRecordDraft) -> Self {
        Self { measurement_run_id: run_id,
               measurement_program_step_id: d.measurement_program_step_id,
               instrument_id: d.instrument_id,
               operator_id: d.operator_id,
               real_value: d.real_value,
               status: d.status.as_str(),
               lsl: d.lsl,
               target_value: d.target_value,
               usl: d.usl,
               measurement_unit_id: d.measurement_unit_id,
               step_fingerprint: &d.step_fingerprint }
    }
}

/// Parche parcial: los `None` no generan columna en el `UPDATE`.
#[derive(AsChangeset, Debug)]
#[diesel(table_name = step_records)]
pub struct RecordChanges {
    pub real_value: Option<f64>,
    pub status: Option<&'static str>,
}

impl From<&StepRecordPatch> for RecordChanges {
    fn from(p: &StepRecordPatch) -> Self {
        Self { real_value: p.real_value,
               status: p.status.map(|s| s.as_str()) }
    }
}

pub fn records_from_rows(rows: Vec<RecordRow>) -> Result<Vec<StepRecord>, PersistenceError> {
    rows.into_iter().map(StepRecord::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> RecordRow {
        RecordRow { id: 3,
                    measurement_run_id: 1,
                    measurement_program_step_id: 2,
                    instrument_id: 5,
                    operator_id: 9,
                    real_value: 1.5,
                    status: status.into(),
                    lsl: 1.0,
                    target_value: 2.0,
                    usl: 3.0,
                    measurement_unit_id: 4,
                    step_fingerprint: "ab".into() }
    }

    #[test]
    fn legacy_in_progress_status_reads_as_pending() {
        let record = StepRecord::try_from(row("InProgress")).unwrap();
        assert_eq!(record.status, StepStatus::Pending);
    }

    #[test]
    fn unknown_status_is_persistence_error() {
        assert!(matches!(StepRecord::try_from(row("Skipped")), Err(PersistenceError::Unknown(_))));
    }

    #[test]
    fn new_record_row_takes_run_and_snapshot() {
        let draft = StepRecordDraft { measurement_program_step_id: 2,
                                      instrument_id: 5,
                                      operator_id: 9,
                                      real_value: 0.0,
                                      status: StepStatus::Pending,
                                      lsl: 1.0,
                                      target_value: 2.0,
                                      usl: 3.0,
                                      measurement_unit_id: 4,
                                      step_fingerprint: "ab".into() };
        let row = NewRecordRow::new(11, &draft);
        assert_eq!(row.measurement_run_id, 11);
        assert_eq!((row.lsl, row.target_value, row.usl, row.measurement_unit_id), (1.0, 2.0, 3.0, 4));
        assert_eq!(row.status, "Pending");
    }

    #[test]
    fn empty_patch_produces_no_columns() {
        let changes = RecordChanges::from(&StepRecordPatch::default());
        assert!(changes.real_value.is_none() && changes.status.is_none());
    }
}
