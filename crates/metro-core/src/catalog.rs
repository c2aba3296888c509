//! Catálogo de plantillas: programas, pasos, instrumentos y unidades.
//!
//! Toda escritura pasa por la validación de `validation`. Los borrados de
//! filas referenciadas por datos históricos se rechazan con
//! `CoreError::Referential` antes de tocar el store.
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use metro_domain::{Instrument, MeasurementProgram, MeasurementUnit, ProgramStep};

use crate::config::CoreConfig;
use crate::errors::{CoreError, EntityKind};
use crate::repo::{DependencyTarget, MetrologyRepository, ProgramUpsert};
use crate::validation::{self, FieldBag, ReferentialValidator};

/// Programa con sus pasos ordenados por `(order, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramDetail {
    pub program: MeasurementProgram,
    pub steps: Vec<ProgramStep>,
}

pub struct TemplateCatalog<R: MetrologyRepository> {
    repo: Arc<R>,
    validator: ReferentialValidator<R>,
}

impl<R: MetrologyRepository> TemplateCatalog<R> {
    pub fn new(repo: Arc<R>, config: &CoreConfig) -> Self {
        let validator = ReferentialValidator::new(repo.clone(), config.strict_tolerances);
        Self { repo, validator }
    }

    // ---------------- programas ----------------

    pub async fn list_programs(&self) -> Result<Vec<MeasurementProgram>, CoreError> {
        self.repo.list_programs().await
    }

    pub async fn program_detail(&self, id: i64) -> Result<ProgramDetail, CoreError> {
        let program = self.require_program(id).await?;
        let steps = self.repo.list_program_steps(id).await?;
        Ok(ProgramDetail { program, steps })
    }

    pub async fn create_program(&self, bag: &FieldBag) -> Result<MeasurementProgram, CoreError> {
        let fields = validation::validate_program_fields(bag)?;
        let program = self.repo
                          .upsert_program(ProgramUpsert { id: None, fields, updated_at: Utc::now() })
                          .await?;
        info!("catalog:create_program id={} name={:?}", program.id, program.name);
        Ok(program)
    }

    /// Reemplaza nombre y descripción; `updatedAt` se renueva.
    pub async fn update_program(&self, id: i64, bag: &FieldBag) -> Result<MeasurementProgram, CoreError> {
        self.require_program(id).await?;
        let fields = validation::validate_program_fields(bag)?;
        self.repo
            .upsert_program(ProgramUpsert { id: Some(id), fields, updated_at: Utc::now() })
            .await
    }

    /// Borra el programa y sus pasos. Rechazado mientras existan corridas.
    pub async fn delete_program(&self, id: i64) -> Result<(), CoreError> {
        self.require_program(id).await?;
        self.ensure_unreferenced("programId", DependencyTarget::Program(id), id).await?;
        if !self.repo.delete_program(id).await? {
            return Err(CoreError::not_found(EntityKind::Program, id));
        }
        info!("catalog:delete_program id={id}");
        Ok(())
    }

    // ---------------- pasos ----------------

    pub async fn add_step(&self, bag: &FieldBag) -> Result<ProgramStep, CoreError> {
        let definition = self.validator.validate_step_definition(bag).await?;
        let step = self.repo.insert_program_step(&definition).await?;
        debug!("catalog:add_step id={} program_id={} order={}", step.id, step.program_id, step.order);
        Ok(step)
    }

    /// Reemplaza la definición de un paso. Los registros ya instanciados no
    /// cambian; la divergencia se observa con `RunInstantiator::binding_drift`.
    /// Un paso no puede mudarse a otro programa.
    pub async fn update_step(&self, id: i64, bag: &FieldBag) -> Result<ProgramStep, CoreError> {
        let current = self.repo
                          .get_program_step(id)
                          .await?
                          .ok_or_else(|| CoreError::not_found(EntityKind::ProgramStep, id))?;
        let definition = self.validator.validate_step_definition(bag).await?;
        if definition.program_id != current.program_id {
            return Err(CoreError::validation("programId",
                                             format!("el paso pertenece al programa {}", current.program_id)));
        }
        self.repo
            .update_program_step(id, &definition)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::ProgramStep, id))
    }

    pub async fn delete_step(&self, id: i64) -> Result<(), CoreError> {
        if self.repo.get_program_step(id).await?.is_none() {
            return Err(CoreError::not_found(EntityKind::ProgramStep, id));
        }
        self.ensure_unreferenced("measurementProgramStepId", DependencyTarget::ProgramStep(id), id)
            .await?;
        if !self.repo.delete_program_step(id).await? {
            return Err(CoreError::not_found(EntityKind::ProgramStep, id));
        }
        debug!("catalog:delete_step id={id}");
        Ok(())
    }

    // ---------------- instrumentos ----------------

    pub async fn list_instruments(&self) -> Result<Vec<Instrument>, CoreError> {
        self.repo.list_instruments().await
    }

    pub async fn get_instrument(&self, id: i64) -> Result<Instrument, CoreError> {
        self.repo
            .get_instrument(id)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::Instrument, id))
    }

    pub async fn create_instrument(&self, bag: &FieldBag) -> Result<Instrument, CoreError> {
        let definition = self.validator.validate_instrument(bag).await?;
        let instrument = self.repo.insert_instrument(&definition).await?;
        info!("catalog:create_instrument id={} serial={}", instrument.id, instrument.serial_number);
        Ok(instrument)
    }

    pub async fn update_instrument(&self, id: i64, bag: &FieldBag) -> Result<Instrument, CoreError> {
        self.get_instrument(id).await?;
        let definition = self.validator.validate_instrument(bag).await?;
        self.repo
            .update_instrument(id, &definition)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::Instrument, id))
    }

    /// Rechazado mientras algún paso de programa o registro lo use.
    pub async fn delete_instrument(&self, id: i64) -> Result<(), CoreError> {
        self.get_instrument(id).await?;
        self.ensure_unreferenced("instrumentId", DependencyTarget::Instrument(id), id).await?;
        if !self.repo.delete_instrument(id).await? {
            return Err(CoreError::not_found(EntityKind::Instrument, id));
        }
        info!("catalog:delete_instrument id={id}");
        Ok(())
    }

    // ---------------- unidades ----------------

    pub async fn list_units(&self) -> Result<Vec<MeasurementUnit>, CoreError> {
        self.repo.list_units().await
    }

    pub async fn create_unit(&self, bag: &FieldBag) -> Result<MeasurementUnit, CoreError> {
        let definition = validation::validate_unit(bag)?;
        self.repo.insert_unit(&definition).await
    }

    pub async fn update_unit(&self, id: i64, bag: &FieldBag) -> Result<MeasurementUnit, CoreError> {
        if self.repo.get_unit(id).await?.is_none() {
            return Err(CoreError::not_found(EntityKind::Unit, id));
        }
        let definition = validation::validate_unit(bag)?;
        self.repo
            .update_unit(id, &definition)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::Unit, id))
    }

    pub async fn delete_unit(&self, id: i64) -> Result<(), CoreError> {
        if self.repo.get_unit(id).await?.is_none() {
            return Err(CoreError::not_found(EntityKind::Unit, id));
        }
        self.ensure_unreferenced("measurementUnitId", DependencyTarget::Unit(id), id).await?;
        if !self.repo.delete_unit(id).await? {
            return Err(CoreError::not_found(EntityKind::Unit, id));
        }
        Ok(())
    }

    // ---------------- auxiliares ----------------

    async fn require_program(&self, id: i64) -> Result<MeasurementProgram, CoreError> {
        self.repo
            .get_program(id)
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKind::Program, id))
    }

    async fn ensure_unreferenced(&self, field: &str, target: DependencyTarget, id: i64) -> Result<(), CoreError> {
        let dependents = self.repo.count_dependents(target).await?;
        if dependents > 0 {
            debug!("catalog:delete_rejected target={target:?} dependents={dependents}");
            return Err(CoreError::still_referenced(field, id, dependents));
        }
        Ok(())
    }
}
