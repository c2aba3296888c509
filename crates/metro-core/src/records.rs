//! Actualización y lectura de registros de paso.
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use metro_domain::{MeasurementProgram, MeasurementRun, MeasurementUnit, ProgramStep, StepRecord, StepRecordPatch,
                   StepStatus};

use crate::config::{CoreConfig, StatusPolicy};
use crate::errors::{CoreError, EntityKind};
use crate::repo::MetrologyRepository;
use crate::validation::{self, FieldBag};

/// Fila de la planilla: el registro con su paso actual y la unidad con la que
/// se instanció. `step` es `None` si el paso ya no existe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSheetRow {
    pub record: StepRecord,
    pub step: Option<ProgramStep>,
    pub unit: Option<MeasurementUnit>,
}

impl RunSheetRow {
    /// `Some(ok)` para registros `Done`, juzgados contra los límites
    /// copiados al instanciar; `None` si todavía no hay medición.
    pub fn within_tolerance(&self) -> Option<bool> {
        match self.record.status {
            StepStatus::Done => Some(self.record.accepts(self.record.real_value)),
            StepStatus::Pending => None,
        }
    }
}

/// Vista de una corrida para el operador.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSheet {
    pub run: MeasurementRun,
    pub program: MeasurementProgram,
    pub rows: Vec<RunSheetRow>,
}

impl RunSheet {
    pub fn is_complete(&self) -> bool {
        self.rows.iter().all(|r| r.record.status == StepStatus::Done)
    }

    /// Registros `Done` fuera de `[lsl, usl]`.
    pub fn out_of_tolerance(&self) -> impl Iterator<Item = &RunSheetRow> {
        self.rows.iter().filter(|r| r.within_tolerance() == Some(false))
    }
}

pub struct StepRecordStore<R: MetrologyRepository> {
    repo: Arc<R>,
    policy: StatusPolicy,
}

impl<R: MetrologyRepository> StepRecordStore<R> {
    pub fn new(repo: Arc<R>, config: &CoreConfig) -> Self {
        Self { repo, policy: config.status_policy }
    }

    pub async fn get_step_record(&self, id: i64) -> Result<StepRecord, CoreError> {
        self.repo
            .get_step_record(id)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::StepRecord, id))
    }

    /// Actualización parcial. Re-aplicar el mismo parche deja el mismo
    /// registro. No recalcula `finishedAt` de la corrida. La política de
    /// estados la aplica el repositorio en la misma escritura.
    pub async fn update_step_record(&self, id: i64, patch: StepRecordPatch) -> Result<StepRecord, CoreError> {
        if let Some(value) = patch.real_value {
            if !value.is_finite() {
                return Err(CoreError::validation("realValue", format!("valor no finito: {value}")));
            }
        }
        if patch.is_empty() {
            return self.get_step_record(id).await;
        }
        let updated = self.repo
                          .update_step_record(id, &patch, self.policy)
                          .await?
                          .ok_or_else(|| CoreError::not_found(EntityKind::StepRecord, id))?;
        debug!("records:update id={id} status={} real_value={}", updated.status, updated.real_value);
        Ok(updated)
    }

    /// Igual que `update_step_record` partiendo de un envío sin tipo.
    pub async fn update_step_record_fields(&self, id: i64, bag: &FieldBag) -> Result<StepRecord, CoreError> {
        let patch = validation::validate_step_record_patch(bag)?;
        self.update_step_record(id, patch).await
    }

    pub async fn list_for_run(&self, run_id: i64) -> Result<Vec<StepRecord>, CoreError> {
        self.require_run(run_id).await?;
        self.repo.list_step_records(run_id).await
    }

    /// Planilla de la corrida ordenada por `(order, id)` del paso; registros
    /// sin paso quedan al final.
    pub async fn run_sheet(&self, run_id: i64) -> Result<RunSheet, CoreError> {
        let run = self.require_run(run_id).await?;
        let program = self.repo
                          .get_program(run.program_id)
                          .await?
                          .ok_or_else(|| CoreError::not_found(EntityKind::Program, run.program_id))?;
        let steps: HashMap<i64, ProgramStep> = self.repo
                                                   .list_program_steps(run.program_id)
                                                   .await?
                                                   .into_iter()
                                                   .map(|s| (s.id, s))
                                                   .collect();
        let units: HashMap<i64, MeasurementUnit> =
            self.repo.list_units().await?.into_iter().map(|u| (u.id, u)).collect();

        let mut rows: Vec<RunSheetRow> = self.repo
                                             .list_step_records(run_id)
                                             .await?
                                             .into_iter()
                                             .map(|record| {
                                                 let step = steps.get(&record.measurement_program_step_id).cloned();
                                                 let unit = units.get(&record.measurement_unit_id).cloned();
                                                 RunSheetRow { record, step, unit }
                                             })
                                             .collect();
        rows.sort_by_key(|row| {
                (row.step.is_none(), row.step.as_ref().map(|s| (s.order, s.id)), row.record.id)
            });
        info!("records:run_sheet run_id={run_id} rows={}", rows.len());
        Ok(RunSheet { run, program, rows })
    }

    async fn require_run(&self, run_id: i64) -> Result<MeasurementRun, CoreError> {
        self.repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::Run, run_id))
    }
}
