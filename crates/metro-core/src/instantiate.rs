//! Instanciación de corridas a partir de un programa.
//!
//! Secuencia: programa → pasos ordenados → operador → borradores → alta de
//! la corrida con sus registros en una sola escritura del repositorio. Todas
//! las lecturas ocurren antes de escribir, así que un error de resolución no
//! deja nada persistido.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use metro_domain::{MeasurementRun, Principal, ProgramStep, StepRecord, StepRecordDraft, StepStatus};

use crate::config::CoreConfig;
use crate::errors::{CoreError, EntityKind};
use crate::hashing::fingerprint_step_definition;
use crate::identity::{IdentityProvider, IdentityResolver};
use crate::repo::MetrologyRepository;

/// Corrida recién creada junto con sus registros, en el orden de los pasos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantiatedRun {
    pub run: MeasurementRun,
    pub records: Vec<StepRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriftKind {
    /// El paso de programa ya no existe.
    StepRemoved,
    /// La definición actual del paso no coincide con la huella del registro.
    DefinitionChanged,
}

/// Registro cuya plantilla divergió desde que se instanció la corrida.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingDrift {
    pub record_id: i64,
    pub program_step_id: i64,
    pub kind: DriftKind,
}

pub struct RunInstantiator<R: MetrologyRepository> {
    repo: Arc<R>,
    identity: IdentityResolver<R>,
}

impl<R: MetrologyRepository> RunInstantiator<R> {
    pub fn new(repo: Arc<R>, config: &CoreConfig) -> Self {
        let identity = IdentityResolver::new(repo.clone(), config.enforce_certification);
        Self { repo, identity }
    }

    /// Crea la corrida y un registro `Pending` por paso. Devuelve la corrida.
    pub async fn instantiate(&self, program_id: i64, principal: &Principal) -> Result<MeasurementRun, CoreError> {
        Ok(self.instantiate_with_records(program_id, principal).await?.run)
    }

    /// Igual que `instantiate` pero el principal sale del proveedor de
    /// identidad; sin principal no se escribe nada.
    pub async fn instantiate_for_current(&self, program_id: i64, provider: &dyn IdentityProvider)
                                         -> Result<MeasurementRun, CoreError> {
        let principal = self.identity.resolve_current(provider).await?;
        self.instantiate(program_id, &principal).await
    }

    pub async fn instantiate_with_records(&self, program_id: i64, principal: &Principal)
                                          -> Result<InstantiatedRun, CoreError> {
        let program = self.repo
                          .get_program(program_id)
                          .await?
                          .ok_or_else(|| CoreError::not_found(EntityKind::Program, program_id))?;
        let drafts = self.drafts_for(program.id, principal).await?;
        let expected = drafts.len();
        debug!("instantiate:drafts program_id={} count={expected}", program.id);

        let (run, records) = self.repo.insert_run_with_records(program.id, Utc::now(), drafts).await?;
        if records.len() != expected {
            return Err(CoreError::Persistence(format!("inserción en lote incompleta: {} de {expected}",
                                                      records.len())));
        }
        info!("instantiate:done run_id={} program_id={} records={}",
              run.id,
              program.id,
              records.len());
        Ok(InstantiatedRun { run, records })
    }

    /// Un borrador `Pending` por paso, en orden, para el operador del principal.
    async fn drafts_for(&self, program_id: i64, principal: &Principal) -> Result<Vec<StepRecordDraft>, CoreError> {
        let steps = self.repo.list_program_steps(program_id).await?;
        let operator = self.identity
                           .resolve_operator(principal)
                           .await
                           .map_err(|e| match e {
                               CoreError::NotFound { .. } => {
                                   CoreError::Authorization(format!("ningún operador para el usuario {}",
                                                                    principal.user_id))
                               }
                               other => other,
                           })?;
        Ok(ordered(steps).iter().map(|s| draft_for(operator.id, s)).collect())
    }

    pub async fn list_runs(&self) -> Result<Vec<MeasurementRun>, CoreError> {
        self.repo.list_runs().await
    }

    pub async fn get_run(&self, id: i64) -> Result<MeasurementRun, CoreError> {
        self.repo
            .get_run(id)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::Run, id))
    }

    /// Borra la corrida y sus registros.
    pub async fn delete_run(&self, id: i64) -> Result<(), CoreError> {
        if !self.repo.delete_run(id).await? {
            return Err(CoreError::not_found(EntityKind::Run, id));
        }
        info!("instantiate:delete_run run_id={id}");
        Ok(())
    }

    /// Registros de la corrida cuya plantilla cambió o desapareció.
    pub async fn binding_drift(&self, run_id: i64) -> Result<Vec<BindingDrift>, CoreError> {
        let run = self.get_run(run_id).await?;
        let current: HashMap<i64, ProgramStep> = self.repo
                                                     .list_program_steps(run.program_id)
                                                     .await?
                                                     .into_iter()
                                                     .map(|s| (s.id, s))
                                                     .collect();
        let records = self.repo.list_step_records(run_id).await?;
        Ok(records.into_iter()
                  .filter_map(|r| {
                      let kind = match current.get(&r.measurement_program_step_id) {
                          None => DriftKind::StepRemoved,
                          Some(step) if fingerprint_step_definition(&step.definition()) != r.step_fingerprint => {
                              DriftKind::DefinitionChanged
                          }
                          Some(_) => return None,
                      };
                      Some(BindingDrift { record_id: r.id,
                                          program_step_id: r.measurement_program_step_id,
                                          kind })
                  })
                  .collect())
    }
}

/// Registro `Pending` con la fotografía del paso: instrumento, límites,
/// unidad y huella.
fn draft_for(operator_id: i64, step: &ProgramStep) -> StepRecordDraft {
    StepRecordDraft { measurement_program_step_id: step.id,
                      instrument_id: step.instrument_id,
                      operator_id,
                      real_value: 0.0,
                      status: StepStatus::Pending,
                      lsl: step.lsl,
                      target_value: step.target_value,
                      usl: step.usl,
                      measurement_unit_id: step.measurement_unit_id,
                      step_fingerprint: fingerprint_step_definition(&step.definition()) }
}

/// Orden ascendente por `order`, desempate por id.
fn ordered(mut steps: Vec<ProgramStep>) -> Vec<ProgramStep> {
    steps.sort_by(|a, b| a.order.cmp(&b.order).then(a.id.cmp(&b.id)));
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{FailPoint, InMemoryRepository, ProgramUpsert};
    use chrono::NaiveDate;
    use metro_domain::{InstrumentDefinition, OperatorRegistration, ProgramFields, ProgramStepDefinition,
                       UnitDefinition};
    use uuid::Uuid;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        program_id: i64,
        unit_id: i64,
        instrument_id: i64,
        principal: Principal,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let unit = repo.insert_unit(&UnitDefinition { name: "mm".into(), symbol: "mm".into() }).await.unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
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
        let user = Uuid::new_v4();
        repo.register_operator(OperatorRegistration { user_id: user,
                                                      certification_number: "C".into(),
                                                      certification_date: day,
                                                      certification_expiry_date: NaiveDate::from_ymd_opt(2999, 1, 1).unwrap() })
            .await
            .unwrap();
        Fixture { repo,
                  program_id: program.id,
                  unit_id: unit.id,
                  instrument_id: instrument.id,
                  principal: Principal::new(user) }
    }

    impl Fixture {
        async fn step(&self, order: i32) -> ProgramStep {
            self.repo
                .insert_program_step(&ProgramStepDefinition { program_id: self.program_id,
                                                              order,
                                                              name: format!("paso {order}"),
                                                              description: None,
                                                              lsl: 1.0,
                                                              target_value: 2.0,
                                                              usl: 3.0,
                                                              measurement_unit_id: self.unit_id,
                                                              instrument_id: self.instrument_id })
                .await
                .unwrap()
        }

        fn instantiator(&self) -> RunInstantiator<InMemoryRepository> {
            RunInstantiator::new(self.repo.clone(), &CoreConfig::default())
        }
    }

    #[tokio::test]
    async fn records_follow_step_order_with_id_tiebreak() {
        let fx = fixture().await;
        let late = fx.step(2).await;
        let first = fx.step(1).await;
        let tie = fx.step(2).await;
        let out = fx.instantiator().instantiate_with_records(fx.program_id, &fx.principal).await.unwrap();
        let ids: Vec<i64> = out.records.iter().map(|r| r.measurement_program_step_id).collect();
        assert_eq!(ids, vec![first.id, late.id, tie.id]);
        assert!(out.records.iter().all(|r| r.status == StepStatus::Pending && r.real_value == 0.0));
    }

    #[tokio::test]
    async fn empty_program_yields_run_without_records() {
        let fx = fixture().await;
        fx.repo.fail_on(FailPoint::InsertStepRecords).await;
        let out = fx.instantiator().instantiate_with_records(fx.program_id, &fx.principal).await.unwrap();
        assert!(out.records.is_empty());
        assert_eq!(fx.repo.list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_while_reading_steps_writes_nothing() {
        let fx = fixture().await;
        fx.step(1).await;
        fx.repo.fail_on(FailPoint::ListProgramSteps).await;
        let err = fx.instantiator().instantiate(fx.program_id, &fx.principal).await.unwrap_err();
        assert!(matches!(err, CoreError::Persistence(_)));
        assert!(fx.repo.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_batch_never_exposes_a_run() {
        let fx = fixture().await;
        fx.step(1).await;
        fx.repo.fail_on(FailPoint::InsertStepRecords).await;
        fx.repo.fail_on(FailPoint::DeleteRun).await;
        let err = fx.instantiator().instantiate(fx.program_id, &fx.principal).await.unwrap_err();
        assert!(matches!(err, CoreError::Persistence(ref m) if m.contains("InsertStepRecords")));
        assert!(fx.repo.list_runs().await.unwrap().is_empty());

        fx.repo.clear_failures().await;
        let out = fx.instantiator().instantiate_with_records(fx.program_id, &fx.principal).await.unwrap();
        assert_eq!(fx.repo.list_step_records(out.run.id).await.unwrap(), out.records);
    }

    #[tokio::test]
    async fn unknown_operator_writes_nothing() {
        let fx = fixture().await;
        fx.step(1).await;
        let stranger = Principal::new(Uuid::new_v4());
        let err = fx.instantiator().instantiate(fx.program_id, &stranger).await.unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));
        assert!(fx.repo.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_snapshot_bounds_and_unit() {
        let fx = fixture().await;
        let step = fx.step(1).await;
        let out = fx.instantiator().instantiate_with_records(fx.program_id, &fx.principal).await.unwrap();
        let record = &out.records[0];
        assert_eq!((record.lsl, record.target_value, record.usl), (step.lsl, step.target_value, step.usl));
        assert_eq!(record.measurement_unit_id, fx.unit_id);
        assert_eq!(record.measurement_run_id, out.run.id);
    }

    #[tokio::test]
    async fn missing_program_writes_nothing() {
        let fx = fixture().await;
        let err = fx.instantiator().instantiate(999, &fx.principal).await.unwrap_err();
        assert!(err.is_not_found(EntityKind::Program));
        assert!(fx.repo.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drift_reports_changed_and_removed_steps() {
        let fx = fixture().await;
        let kept = fx.step(1).await;
        let moved = fx.step(2).await;
        let inst = fx.instantiator();
        let out = inst.instantiate_with_records(fx.program_id, &fx.principal).await.unwrap();
        assert!(inst.binding_drift(out.run.id).await.unwrap().is_empty());

        let mut def = moved.definition();
        def.usl = 4.0;
        fx.repo.update_program_step(moved.id, &def).await.unwrap();
        let mut cosmetic = kept.definition();
        cosmetic.description = Some("sólo texto".into());
        fx.repo.update_program_step(kept.id, &cosmetic).await.unwrap();

        let drift = inst.binding_drift(out.run.id).await.unwrap();
        assert_eq!(drift,
                   vec![BindingDrift { record_id: out.records[1].id,
                                       program_step_id: moved.id,
                                       kind: DriftKind::DefinitionChanged }]);
        // el registro conserva el instrumento con el que se instanció
        assert_eq!(out.records[1].instrument_id, fx.instrument_id);
    }

    #[tokio::test]
    async fn delete_run_removes_records() {
        let fx = fixture().await;
        fx.step(1).await;
        let inst = fx.instantiator();
        let run = inst.instantiate(fx.program_id, &fx.principal).await.unwrap();
        inst.delete_run(run.id).await.unwrap();
        assert!(fx.repo.list_step_records(run.id).await.unwrap().is_empty());
        assert!(inst.get_run(run.id).await.unwrap_err().is_not_found(EntityKind::Run));
    }
}
