//! Contrato de almacenamiento consumido por el core.
//!
//! El core nunca implementa un motor de persistencia: habla con este trait.
//! Implementaciones: `InMemoryRepository` (este crate) y `PgRepository`
//! (`metro-persistence`).
//!
//! Convenciones:
//! - `get_*` devuelve `Ok(None)` si la fila no existe.
//! - `delete_*` devuelve `Ok(true)` si se borró una fila.
//! - Cualquier falla propia del almacenamiento (conexión, violación de clave
//!   foránea, etc.) llega como `CoreError::Persistence`.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, warn};
use uuid::Uuid;

use metro_domain::{Instrument, InstrumentDefinition, MeasurementProgram, MeasurementRun, MeasurementUnit, Operator,
                   ProgramFields, ProgramStep, ProgramStepDefinition, StepRecord, StepRecordDraft, StepRecordPatch,
                   UnitDefinition};

use crate::config::StatusPolicy;
use crate::errors::CoreError;

/// Alta (`id = None`) o reemplazo (`id = Some`, la fila debe existir) de un
/// programa. `created_at` se conserva en los reemplazos.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramUpsert {
    pub id: Option<i64>,
    pub fields: ProgramFields,
    pub updated_at: DateTime<Utc>,
}

/// Fila cuyas referencias entrantes se cuentan antes de borrarla.
///
/// - `Program`: corridas del programa.
/// - `ProgramStep`: registros de paso que lo referencian.
/// - `Instrument`: pasos de programa y registros de paso.
/// - `Unit`: instrumentos, pasos de programa y registros de paso.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyTarget {
    Program(i64),
    ProgramStep(i64),
    Instrument(i64),
    Unit(i64),
}

#[async_trait]
pub trait MetrologyRepository: Send + Sync {
    // Programas
    async fn list_programs(&self) -> Result<Vec<MeasurementProgram>, CoreError>;
    async fn get_program(&self, id: i64) -> Result<Option<MeasurementProgram>, CoreError>;
    async fn upsert_program(&self, upsert: ProgramUpsert) -> Result<MeasurementProgram, CoreError>;
    /// Borra el programa junto con sus pasos.
    async fn delete_program(&self, id: i64) -> Result<bool, CoreError>;

    // Pasos de programa
    /// Pasos del programa en orden ascendente por `order` (desempate por id).
    async fn list_program_steps(&self, program_id: i64) -> Result<Vec<ProgramStep>, CoreError>;
    async fn get_program_step(&self, id: i64) -> Result<Option<ProgramStep>, CoreError>;
    async fn insert_program_step(&self, definition: &ProgramStepDefinition) -> Result<ProgramStep, CoreError>;
    async fn update_program_step(&self, id: i64, definition: &ProgramStepDefinition)
                                 -> Result<Option<ProgramStep>, CoreError>;
    async fn delete_program_step(&self, id: i64) -> Result<bool, CoreError>;

    // Instrumentos
    async fn list_instruments(&self) -> Result<Vec<Instrument>, CoreError>;
    async fn get_instrument(&self, id: i64) -> Result<Option<Instrument>, CoreError>;
    async fn insert_instrument(&self, definition: &InstrumentDefinition) -> Result<Instrument, CoreError>;
    async fn update_instrument(&self, id: i64, definition: &InstrumentDefinition)
                               -> Result<Option<Instrument>, CoreError>;
    async fn delete_instrument(&self, id: i64) -> Result<bool, CoreError>;

    // Unidades
    async fn list_units(&self) -> Result<Vec<MeasurementUnit>, CoreError>;
    async fn get_unit(&self, id: i64) -> Result<Option<MeasurementUnit>, CoreError>;
    async fn insert_unit(&self, definition: &UnitDefinition) -> Result<MeasurementUnit, CoreError>;
    async fn update_unit(&self, id: i64, definition: &UnitDefinition) -> Result<Option<MeasurementUnit>, CoreError>;
    async fn delete_unit(&self, id: i64) -> Result<bool, CoreError>;

    // Operadores
    async fn find_operator_by_user_id(&self, user_id: Uuid) -> Result<Option<Operator>, CoreError>;

    // Corridas
    async fn insert_run(&self, program_id: i64, started_at: DateTime<Utc>) -> Result<MeasurementRun, CoreError>;
    async fn get_run(&self, id: i64) -> Result<Option<MeasurementRun>, CoreError>;
    async fn list_runs(&self) -> Result<Vec<MeasurementRun>, CoreError>;
    /// Borra la corrida y sus registros de paso.
    async fn delete_run(&self, id: i64) -> Result<bool, CoreError>;

    /// Alta de la corrida junto con sus registros como una sola unidad: ningún
    /// lector ve la corrida sin sus registros. Los stores con transacciones lo
    /// sobrescriben; el default compensa con `delete_run`.
    async fn insert_run_with_records(&self, program_id: i64, started_at: DateTime<Utc>,
                                     drafts: Vec<StepRecordDraft>)
                                     -> Result<(MeasurementRun, Vec<StepRecord>), CoreError> {
        insert_run_then_records(self, program_id, started_at, drafts).await
    }

    // Registros de paso
    /// Inserción en lote sobre la corrida `run_id`: o entran todos los
    /// borradores o ninguno. Devuelve los registros en el mismo orden que
    /// `drafts`.
    async fn insert_step_records(&self, run_id: i64, drafts: Vec<StepRecordDraft>)
                                 -> Result<Vec<StepRecord>, CoreError>;
    async fn get_step_record(&self, id: i64) -> Result<Option<StepRecord>, CoreError>;
    /// Registros de una corrida ordenados por id (orden de instanciación).
    async fn list_step_records(&self, run_id: i64) -> Result<Vec<StepRecord>, CoreError>;
    /// Aplica el parche en una sola escritura. Con `ForwardOnly`, un
    /// `Done -> Pending` se rechaza con `CoreError::Validation { field: "status" }`
    /// contra el estado vigente en el momento de escribir.
    async fn update_step_record(&self, id: i64, patch: &StepRecordPatch, policy: StatusPolicy)
                                -> Result<Option<StepRecord>, CoreError>;

    async fn count_dependents(&self, target: DependencyTarget) -> Result<u64, CoreError>;
}

/// Alta de corrida y registros en dos escrituras, para stores sin
/// transacciones. Si el lote falla se borra la corrida y se devuelve el error
/// original aunque la compensación también falle.
pub async fn insert_run_then_records<R>(repo: &R, program_id: i64, started_at: DateTime<Utc>,
                                        drafts: Vec<StepRecordDraft>)
                                        -> Result<(MeasurementRun, Vec<StepRecord>), CoreError>
    where R: MetrologyRepository + ?Sized
{
    let run = repo.insert_run(program_id, started_at).await?;
    if drafts.is_empty() {
        return Ok((run, Vec::new()));
    }
    match repo.insert_step_records(run.id, drafts).await {
        Ok(records) => Ok((run, records)),
        Err(err) => {
            warn!("repo:rollback run_id={} cause={err}", run.id);
            if let Err(comp) = repo.delete_run(run.id).await {
                error!("repo:compensation_failed run_id={} err={comp}", run.id);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{FailPoint, InMemoryRepository};
    use chrono::NaiveDate;
    use metro_domain::{OperatorRegistration, StepStatus};

    async fn seeded() -> (InMemoryRepository, ProgramStep, i64) {
        let repo = InMemoryRepository::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let unit = repo.insert_unit(&UnitDefinition { name: "mm".into(), symbol: "mm".into() }).await.unwrap();
        let instrument = repo.insert_instrument(&InstrumentDefinition { name: "Calibre".into(),
                                                                        manufacturer: "M".into(),
                                                                        model: "X".into(),
                                                                        serial_number: "1".into(),
                                                                        accuracy: 0.01,
                                                                        resolution: 0.01,
                                                                        lower_limit: 0.0,
                                                                        upper_limit: 10.0,
                                                                        measurement_unit_id: unit.id,
                                                                        location: "L".into(),
                                                                        calibration_date: day,
                                                                        verification_date: day,
                                                                        verification_due_date: day,
                                                                        notes: None })
                             .await
                             .unwrap();
        let program = repo.upsert_program(ProgramUpsert { id: None,
                                                          fields: ProgramFields { name: "P".into(), description: None },
                                                          updated_at: Utc::now() })
                          .await
                          .unwrap();
        let step = repo.insert_program_step(&ProgramStepDefinition { program_id: program.id,
                                                                     order: 1,
                                                                     name: "s".into(),
                                                                     description: None,
                                                                     lsl: 1.0,
                                                                     target_value: 2.0,
                                                                     usl: 3.0,
                                                                     measurement_unit_id: unit.id,
                                                                     instrument_id: instrument.id })
                       .await
                       .unwrap();
        let operator = repo.register_operator(OperatorRegistration { user_id: Uuid::new_v4(),
                                                                     certification_number: "C".into(),
                                                                     certification_date: day,
                                                                     certification_expiry_date: day })
                           .await
                           .unwrap();
        (repo, step, operator.id)
    }

    fn draft(step: &ProgramStep, operator_id: i64) -> StepRecordDraft {
        StepRecordDraft { measurement_program_step_id: step.id,
                          instrument_id: step.instrument_id,
                          operator_id,
                          real_value: 0.0,
                          status: StepStatus::Pending,
                          lsl: step.lsl,
                          target_value: step.target_value,
                          usl: step.usl,
                          measurement_unit_id: step.measurement_unit_id,
                          step_fingerprint: "fp".into() }
    }

    #[tokio::test]
    async fn two_phase_insert_compensates_failed_batch() {
        let (repo, step, operator_id) = seeded().await;
        repo.fail_on(FailPoint::InsertStepRecords).await;
        let err = insert_run_then_records(&repo, step.program_id, Utc::now(), vec![draft(&step, operator_id)])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Persistence(ref m) if m.contains("InsertStepRecords")));
        assert!(repo.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_compensation_still_returns_batch_error() {
        let (repo, step, operator_id) = seeded().await;
        repo.fail_on(FailPoint::InsertStepRecords).await;
        repo.fail_on(FailPoint::DeleteRun).await;
        let err = insert_run_then_records(&repo, step.program_id, Utc::now(), vec![draft(&step, operator_id)])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Persistence(ref m) if m.contains("InsertStepRecords")));
    }

    #[tokio::test]
    async fn two_phase_insert_without_drafts_skips_batch() {
        let (repo, step, _) = seeded().await;
        repo.fail_on(FailPoint::InsertStepRecords).await;
        let (run, records) = insert_run_then_records(&repo, step.program_id, Utc::now(), Vec::new()).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(repo.get_run(run.id).await.unwrap(), Some(run));
    }
}
