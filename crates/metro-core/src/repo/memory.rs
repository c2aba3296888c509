//! Repositorio en memoria.
//!
//! Paridad con el backend Postgres: secuencias monotónicas por tabla, chequeo
//! de claves foráneas del lado del store (reportado como
//! `CoreError::Persistence`) y escrituras multi-fila atómicas bajo un único
//! write lock. Con `cfg(test)` o la feature `testing` permite inyectar
//! fallas (`FailPoint`) en operaciones puntuales.
#[cfg(any(test, feature = "testing"))]
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use metro_domain::{Instrument, InstrumentDefinition, MeasurementProgram, MeasurementRun, MeasurementUnit, Operator,
                   OperatorRegistration, ProgramStep, ProgramStepDefinition, StepRecord, StepRecordDraft,
                   StepRecordPatch, UnitDefinition};

use super::types::{DependencyTarget, MetrologyRepository, ProgramUpsert};
use crate::config::StatusPolicy;
use crate::errors::CoreError;

/// Operación del store que puede forzarse a fallar.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertRun,
    ListProgramSteps,
    InsertStepRecords,
    DeleteRun,
    UpdateStepRecord,
}

#[derive(Default)]
struct Sequences {
    program: i64,
    step: i64,
    instrument: i64,
    unit: i64,
    operator: i64,
    run: i64,
    record: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

fn fk_violation(detail: impl std::fmt::Display) -> CoreError {
    CoreError::Persistence(format!("foreign key violation: {detail}"))
}

#[derive(Default)]
struct Tables {
    programs: IndexMap<i64, MeasurementProgram>,
    steps: IndexMap<i64, ProgramStep>,
    instruments: IndexMap<i64, Instrument>,
    units: IndexMap<i64, MeasurementUnit>,
    operators: IndexMap<i64, Operator>,
    runs: IndexMap<i64, MeasurementRun>,
    records: IndexMap<i64, StepRecord>,
    seq: Sequences,
}

impl Tables {
    fn dependents(&self, target: DependencyTarget) -> u64 {
        let count = match target {
            DependencyTarget::Program(id) => self.runs.values().filter(|r| r.program_id == id).count(),
            DependencyTarget::ProgramStep(id) => {
                self.records.values().filter(|r| r.measurement_program_step_id == id).count()
            }
            DependencyTarget::Instrument(id) => {
                self.steps.values().filter(|s| s.instrument_id == id).count()
                + self.records.values().filter(|r| r.instrument_id == id).count()
            }
            DependencyTarget::Unit(id) => {
                self.instruments.values().filter(|i| i.measurement_unit_id == id).count()
                + self.steps.values().filter(|s| s.measurement_unit_id == id).count()
                + self.records.values().filter(|r| r.measurement_unit_id == id).count()
            }
        };
        count as u64
    }

    fn check_step_refs(&self, def: &ProgramStepDefinition) -> Result<(), CoreError> {
        if !self.programs.contains_key(&def.program_id) {
            return Err(fk_violation(format!("programId={}", def.program_id)));
        }
        if !self.units.contains_key(&def.measurement_unit_id) {
            return Err(fk_violation(format!("measurementUnitId={}", def.measurement_unit_id)));
        }
        if !self.instruments.contains_key(&def.instrument_id) {
            return Err(fk_violation(format!("instrumentId={}", def.instrument_id)));
        }
        Ok(())
    }

    fn check_record_refs(&self, draft: &StepRecordDraft) -> Result<(), CoreError> {
        if !self.steps.contains_key(&draft.measurement_program_step_id) {
            return Err(fk_violation(format!("measurementProgramStepId={}", draft.measurement_program_step_id)));
        }
        if !self.instruments.contains_key(&draft.instrument_id) {
            return Err(fk_violation(format!("instrumentId={}", draft.instrument_id)));
        }
        if !self.operators.contains_key(&draft.operator_id) {
            return Err(fk_violation(format!("operatorId={}", draft.operator_id)));
        }
        if !self.units.contains_key(&draft.measurement_unit_id) {
            return Err(fk_violation(format!("measurementUnitId={}", draft.measurement_unit_id)));
        }
        Ok(())
    }

    fn insert_run(&mut self, program_id: i64, started_at: DateTime<Utc>) -> Result<MeasurementRun, CoreError> {
        if !self.programs.contains_key(&program_id) {
            return Err(fk_violation(format!("programId={program_id}")));
        }
        let id = next_id(&mut self.seq.run);
        let run = MeasurementRun { id,
                                   program_id,
                                   started_at,
                                   finished_at: None };
        self.runs.insert(id, run.clone());
        Ok(run)
    }

    /// Escribe el lote ya validado con `check_record_refs`.
    fn push_records(&mut self, run_id: i64, drafts: Vec<StepRecordDraft>) -> Vec<StepRecord> {
        drafts.into_iter()
              .map(|draft| {
                  let id = next_id(&mut self.seq.record);
                  let record = draft.into_record(id, run_id);
                  self.records.insert(id, record.clone());
                  record
              })
              .collect()
    }

    fn restrict(&self, target: DependencyTarget) -> Result<(), CoreError> {
        match self.dependents(target) {
            0 => Ok(()),
            n => Err(fk_violation(format!("{target:?} referenciado por {n} fila(s)"))),
        }
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
    #[cfg(any(test, feature = "testing"))]
    failures: RwLock<HashSet<FailPoint>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alta de operador (sembrado / administración). `user_id` es único.
    pub async fn register_operator(&self, registration: OperatorRegistration) -> Result<Operator, CoreError> {
        let mut t = self.tables.write().await;
        if t.operators.values().any(|o| o.user_id == registration.user_id) {
            return Err(CoreError::Persistence(format!("unique violation: userId={}", registration.user_id)));
        }
        let id = next_id(&mut t.seq.operator);
        let operator = registration.into_operator(id);
        t.operators.insert(id, operator.clone());
        Ok(operator)
    }
}

#[cfg(any(test, feature = "testing"))]
impl InMemoryRepository {
    /// Hace que cada llamada futura a `point` falle con `CoreError::Persistence`.
    pub async fn fail_on(&self, point: FailPoint) {
        self.failures.write().await.insert(point);
    }

    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    async fn trip(&self, point: FailPoint) -> Result<(), CoreError> {
        if self.failures.read().await.contains(&point) {
            log::debug!("memory:fail_point tripped point={point:?}");
            return Err(CoreError::Persistence(format!("fallo inyectado en {point:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl MetrologyRepository for InMemoryRepository {
    async fn list_programs(&self) -> Result<Vec<MeasurementProgram>, CoreError> {
        Ok(self.tables.read().await.programs.values().cloned().collect())
    }

    async fn get_program(&self, id: i64) -> Result<Option<MeasurementProgram>, CoreError> {
        Ok(self.tables.read().await.programs.get(&id).cloned())
    }

    async fn upsert_program(&self, upsert: ProgramUpsert) -> Result<MeasurementProgram, CoreError> {
        let mut t = self.tables.write().await;
        let ProgramUpsert { id, fields, updated_at } = upsert;
        let id = match id {
            Some(id) if t.programs.contains_key(&id) => id,
            Some(id) => return Err(CoreError::Persistence(format!("not found: programa id={id}"))),
            None => next_id(&mut t.seq.program),
        };
        let created_at = t.programs.get(&id).map(|p| p.created_at).unwrap_or(updated_at);
        let program = MeasurementProgram { id,
                                           name: fields.name,
                                           description: fields.description,
                                           created_at,
                                           updated_at };
        t.programs.insert(id, program.clone());
        Ok(program)
    }

    async fn delete_program(&self, id: i64) -> Result<bool, CoreError> {
        let mut t = self.tables.write().await;
        if !t.programs.contains_key(&id) {
            return Ok(false);
        }
        t.restrict(DependencyTarget::Program(id))?;
        let step_ids: Vec<i64> = t.steps.values().filter(|s| s.program_id == id).map(|s| s.id).collect();
        for step_id in &step_ids {
            t.restrict(DependencyTarget::ProgramStep(*step_id))?;
        }
        t.steps.retain(|_, s| s.program_id != id);
        t.programs.shift_remove(&id);
        Ok(true)
    }

    async fn list_program_steps(&self, program_id: i64) -> Result<Vec<ProgramStep>, CoreError> {
        #[cfg(any(test, feature = "testing"))]
        self.trip(FailPoint::ListProgramSteps).await?;
        let t = self.tables.read().await;
        let mut steps: Vec<ProgramStep> = t.steps.values().filter(|s| s.program_id == program_id).cloned().collect();
        steps.sort_by(|a, b| a.order.cmp(&b.order).then(a.id.cmp(&b.id)));
        Ok(steps)
    }

    async fn get_program_step(&self, id: i64) -> Result<Option<ProgramStep>, CoreError> {
        Ok(self.tables.read().await.steps.get(&id).cloned())
    }

    async fn insert_program_step(&self, definition: &ProgramStepDefinition) -> Result<ProgramStep, CoreError> {
        let mut t = self.tables.write().await;
        t.check_step_refs(definition)?;
        let id = next_id(&mut t.seq.step);
        let step = definition.clone().into_step(id);
        t.steps.insert(id, step.clone());
        Ok(step)
    }

    async fn update_program_step(&self, id: i64, definition: &ProgramStepDefinition)
                                 -> Result<Option<ProgramStep>, CoreError> {
        let mut t = self.tables.write().await;
        if !t.steps.contains_key(&id) {
            return Ok(None);
        }
        t.check_step_refs(definition)?;
        let step = definition.clone().into_step(id);
        t.steps.insert(id, step.clone());
        Ok(Some(step))
    }

    async fn delete_program_step(&self, id: i64) -> Result<bool, CoreError> {
        let mut t = self.tables.write().await;
        if !t.steps.contains_key(&id) {
            return Ok(false);
        }
        t.restrict(DependencyTarget::ProgramStep(id))?;
        Ok(t.steps.shift_remove(&id).is_some())
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>, CoreError> {
        Ok(self.tables.read().await.instruments.values().cloned().collect())
    }

    async fn get_instrument(&self, id: i64) -> Result<Option<Instrument>, CoreError> {
        Ok(self.tables.read().await.instruments.get(&id).cloned())
    }

    async fn insert_instrument(&self, definition: &InstrumentDefinition) -> Result<Instrument, CoreError> {
        let mut t = self.tables.write().await;
        if !t.units.contains_key(&definition.measurement_unit_id) {
            return Err(fk_violation(format!("measurementUnitId={}", definition.measurement_unit_id)));
        }
        let id = next_id(&mut t.seq.instrument);
        let instrument = definition.clone().into_instrument(id);
        t.instruments.insert(id, instrument.clone());
        Ok(instrument)
    }

    async fn update_instrument(&self, id: i64, definition: &InstrumentDefinition)
                               -> Result<Option<Instrument>, CoreError> {
        let mut t = self.tables.write().await;
        if !t.instruments.contains_key(&id) {
            return Ok(None);
        }
        if !t.units.contains_key(&definition.measurement_unit_id) {
            return Err(fk_violation(format!("measurementUnitId={}", definition.measurement_unit_id)));
        }
        let instrument = definition.clone().into_instrument(id);
        t.instruments.insert(id, instrument.clone());
        Ok(Some(instrument))
    }

    async fn delete_instrument(&self, id: i64) -> Result<bool, CoreError> {
        let mut t = self.tables.write().await;
        if !t.instruments.contains_key(&id) {
            return Ok(false);
        }
        t.restrict(DependencyTarget::Instrument(id))?;
        Ok(t.instruments.shift_remove(&id).is_some())
    }

    async fn list_units(&self) -> Result<Vec<MeasurementUnit>, CoreError> {
        let mut units: Vec<MeasurementUnit> = self.tables.read().await.units.values().cloned().collect();
        units.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(units)
    }

    async fn get_unit(&self, id: i64) -> Result<Option<MeasurementUnit>, CoreError> {
        Ok(self.tables.read().await.units.get(&id).cloned())
    }

    async fn insert_unit(&self, definition: &UnitDefinition) -> Result<MeasurementUnit, CoreError> {
        let mut t = self.tables.write().await;
        let id = next_id(&mut t.seq.unit);
        let unit = definition.clone().into_unit(id);
        t.units.insert(id, unit.clone());
        Ok(unit)
    }

    async fn update_unit(&self, id: i64, definition: &UnitDefinition) -> Result<Option<MeasurementUnit>, CoreError> {
        let mut t = self.tables.write().await;
        match t.units.get_mut(&id) {
            Some(unit) => {
                unit.name = definition.name.clone();
                unit.symbol = definition.symbol.clone();
                Ok(Some(unit.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete_unit(&self, id: i64) -> Result<bool, CoreError> {
        let mut t = self.tables.write().await;
        if !t.units.contains_key(&id) {
            return Ok(false);
        }
        t.restrict(DependencyTarget::Unit(id))?;
        Ok(t.units.shift_remove(&id).is_some())
    }

    async fn find_operator_by_user_id(&self, user_id: Uuid) -> Result<Option<Operator>, CoreError> {
        Ok(self.tables.read().await.operators.values().find(|o| o.user_id == user_id).cloned())
    }

    async fn insert_run(&self, program_id: i64, started_at: DateTime<Utc>) -> Result<MeasurementRun, CoreError> {
        #[cfg(any(test, feature = "testing"))]
        self.trip(FailPoint::InsertRun).await?;
        self.tables.write().await.insert_run(program_id, started_at)
    }

    async fn get_run(&self, id: i64) -> Result<Option<MeasurementRun>, CoreError> {
        Ok(self.tables.read().await.runs.get(&id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<MeasurementRun>, CoreError> {
        Ok(self.tables.read().await.runs.values().cloned().collect())
    }

    async fn delete_run(&self, id: i64) -> Result<bool, CoreError> {
        #[cfg(any(test, feature = "testing"))]
        self.trip(FailPoint::DeleteRun).await?;
        let mut t = self.tables.write().await;
        t.records.retain(|_, r| r.measurement_run_id != id);
        Ok(t.runs.shift_remove(&id).is_some())
    }

    async fn insert_run_with_records(&self, program_id: i64, started_at: DateTime<Utc>,
                                     drafts: Vec<StepRecordDraft>)
                                     -> Result<(MeasurementRun, Vec<StepRecord>), CoreError> {
        #[cfg(any(test, feature = "testing"))]
        {
            self.trip(FailPoint::InsertRun).await?;
            if !drafts.is_empty() {
                self.trip(FailPoint::InsertStepRecords).await?;
            }
        }
        let mut t = self.tables.write().await;
        for draft in &drafts {
            t.check_record_refs(draft)?;
        }
        let run = t.insert_run(program_id, started_at)?;
        let records = t.push_records(run.id, drafts);
        Ok((run, records))
    }

    async fn insert_step_records(&self, run_id: i64, drafts: Vec<StepRecordDraft>)
                                 -> Result<Vec<StepRecord>, CoreError> {
        #[cfg(any(test, feature = "testing"))]
        self.trip(FailPoint::InsertStepRecords).await?;
        let mut t = self.tables.write().await;
        if !t.runs.contains_key(&run_id) {
            return Err(fk_violation(format!("measurementRunId={run_id}")));
        }
        // Validación completa antes de escribir: el lote entra entero o no entra.
        for draft in &drafts {
            t.check_record_refs(draft)?;
        }
        Ok(t.push_records(run_id, drafts))
    }

    async fn get_step_record(&self, id: i64) -> Result<Option<StepRecord>, CoreError> {
        Ok(self.tables.read().await.records.get(&id).cloned())
    }

    async fn list_step_records(&self, run_id: i64) -> Result<Vec<StepRecord>, CoreError> {
        let t = self.tables.read().await;
        let mut records: Vec<StepRecord> =
            t.records.values().filter(|r| r.measurement_run_id == run_id).cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn update_step_record(&self, id: i64, patch: &StepRecordPatch, policy: StatusPolicy)
                                -> Result<Option<StepRecord>, CoreError> {
        #[cfg(any(test, feature = "testing"))]
        self.trip(FailPoint::UpdateStepRecord).await?;
        let mut t = self.tables.write().await;
        let Some(record) = t.records.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(next) = patch.status {
            if policy == StatusPolicy::ForwardOnly && !record.status.can_advance_to(next) {
                return Err(CoreError::illegal_transition(record.status, next));
            }
        }
        patch.apply_to(record);
        Ok(Some(record.clone()))
    }

    async fn count_dependents(&self, target: DependencyTarget) -> Result<u64, CoreError> {
        Ok(self.tables.read().await.dependents(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use metro_domain::{ProgramFields, StepStatus};

    fn instrument_def(unit_id: i64) -> InstrumentDefinition {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        InstrumentDefinition { name: "Calibre".into(),
                               manufacturer: "Mitutoyo".into(),
                               model: "500-196".into(),
                               serial_number: "SN-1".into(),
                               accuracy: 0.02,
                               resolution: 0.01,
                               lower_limit: 0.0,
                               upper_limit: 150.0,
                               measurement_unit_id: unit_id,
                               location: "Lab 1".into(),
                               calibration_date: day,
                               verification_date: day,
                               verification_due_date: day,
                               notes: None }
    }

    async fn seeded() -> (InMemoryRepository, ProgramStep, Operator) {
        let repo = InMemoryRepository::new();
        let unit = repo.insert_unit(&UnitDefinition { name: "milímetro".into(), symbol: "mm".into() }).await.unwrap();
        let instrument = repo.insert_instrument(&instrument_def(unit.id)).await.unwrap();
        let program = repo.upsert_program(ProgramUpsert { id: None,
                                                          fields: ProgramFields { name: "Eje".into(), description: None },
                                                          updated_at: Utc::now() })
                          .await
                          .unwrap();
        let step = repo.insert_program_step(&ProgramStepDefinition { program_id: program.id,
                                                                     order: 1,
                                                                     name: "diámetro".into(),
                                                                     description: None,
                                                                     lsl: 1.0,
                                                                     target_value: 2.0,
                                                                     usl: 3.0,
                                                                     measurement_unit_id: unit.id,
                                                                     instrument_id: instrument.id })
                       .await
                       .unwrap();
        let operator = repo.register_operator(OperatorRegistration { user_id: Uuid::new_v4(),
                                                                     certification_number: "C-1".into(),
                                                                     certification_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                                                                     certification_expiry_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap() })
                           .await
                           .unwrap();
        (repo, step, operator)
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
    async fn batch_insert_is_all_or_nothing() {
        let (repo, step, operator) = seeded().await;
        let run = repo.insert_run(step.program_id, Utc::now()).await.unwrap();
        let mut bad = draft(&step, operator.id);
        bad.measurement_program_step_id = 999;
        let err = repo.insert_step_records(run.id, vec![draft(&step, operator.id), bad]).await.unwrap_err();
        assert!(matches!(err, CoreError::Persistence(_)));
        assert!(repo.list_step_records(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_with_bad_batch_is_never_created() {
        let (repo, step, operator) = seeded().await;
        let mut bad = draft(&step, operator.id);
        bad.operator_id = 999;
        let err = repo.insert_run_with_records(step.program_id, Utc::now(), vec![draft(&step, operator.id), bad])
                      .await
                      .unwrap_err();
        assert!(matches!(err, CoreError::Persistence(_)));
        assert!(repo.list_runs().await.unwrap().is_empty());

        let (run, records) = repo.insert_run_with_records(step.program_id, Utc::now(), vec![draft(&step, operator.id)])
                                 .await
                                 .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].measurement_run_id, run.id);
        assert_eq!(records[0].usl, 3.0);
    }

    #[tokio::test]
    async fn forward_only_is_checked_under_the_write_lock() {
        let (repo, step, operator) = seeded().await;
        let (_, records) = repo.insert_run_with_records(step.program_id, Utc::now(), vec![draft(&step, operator.id)])
                               .await
                               .unwrap();
        let id = records[0].id;
        let done = StepRecordPatch { real_value: Some(2.0), status: Some(StepStatus::Done) };
        let reopen = StepRecordPatch { real_value: None, status: Some(StepStatus::Pending) };
        repo.update_step_record(id, &done, StatusPolicy::ForwardOnly).await.unwrap();

        let err = repo.update_step_record(id, &reopen, StatusPolicy::ForwardOnly).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "status"));
        assert_eq!(repo.get_step_record(id).await.unwrap().map(|r| r.status), Some(StepStatus::Done));

        let reopened = repo.update_step_record(id, &reopen, StatusPolicy::Permissive).await.unwrap();
        assert_eq!(reopened.map(|r| r.status), Some(StepStatus::Pending));
        assert_eq!(repo.update_step_record(999, &done, StatusPolicy::ForwardOnly).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_run_cascades_records() {
        let (repo, step, operator) = seeded().await;
        let run = repo.insert_run(step.program_id, Utc::now()).await.unwrap();
        repo.insert_step_records(run.id, vec![draft(&step, operator.id)]).await.unwrap();
        assert_eq!(repo.count_dependents(DependencyTarget::ProgramStep(step.id)).await.unwrap(), 1);
        assert!(repo.delete_run(run.id).await.unwrap());
        assert_eq!(repo.count_dependents(DependencyTarget::ProgramStep(step.id)).await.unwrap(), 0);
        assert!(!repo.delete_run(run.id).await.unwrap());
    }

    #[tokio::test]
    async fn store_restricts_deleting_referenced_rows() {
        let (repo, step, _) = seeded().await;
        assert!(repo.delete_instrument(step.instrument_id).await.is_err());
        assert!(repo.delete_unit(step.measurement_unit_id).await.is_err());
        assert!(repo.delete_program(step.program_id).await.unwrap());
        assert!(repo.get_program_step(step.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_point_trips_until_cleared() {
        let (repo, step, _) = seeded().await;
        repo.fail_on(FailPoint::InsertRun).await;
        assert!(repo.insert_run(step.program_id, Utc::now()).await.is_err());
        repo.clear_failures().await;
        let run = repo.insert_run(step.program_id, Utc::now()).await.unwrap();
        assert_eq!(run.id, 1);
    }

    #[tokio::test]
    async fn operator_user_id_is_unique() {
        let (repo, _, operator) = seeded().await;
        let dup = OperatorRegistration { user_id: operator.user_id,
                                         certification_number: "C-2".into(),
                                         certification_date: operator.certification_date,
                                         certification_expiry_date: operator.certification_expiry_date };
        assert!(repo.register_operator(dup).await.is_err());
        let found = repo.find_operator_by_user_id(operator.user_id).await.unwrap();
        assert_eq!(found, Some(operator));
    }
}
