//! Validación de envíos sin tipo (`FieldBag`) hacia definiciones tipadas.
//!
//! Dos capas:
//! - Funciones puras (`validate_*`) sobre un `ReferenceSnapshot` ya cargado:
//!   coerción de cada campo en el orden declarado, chequeos opcionales entre
//!   campos y resolución de claves foráneas.
//! - `ReferentialValidator`, que carga la fotografía desde el repositorio y
//!   delega en las funciones puras.
//!
//! Los errores de coerción son `CoreError::Validation` con el nombre del
//! campo; las claves foráneas que no resuelven son `CoreError::Referential`.
pub mod coerce;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use metro_domain::{InstrumentDefinition, ProgramFields, ProgramStepDefinition, StepRecordPatch, StepStatus,
                   UnitDefinition};

use crate::errors::CoreError;
use crate::repo::MetrologyRepository;
pub use coerce::FieldBag;
use coerce::{optional_decimal, optional_string, required_date, required_decimal, required_i32, required_int,
             required_string, string_allow_empty};

/// Convierte un `Value` en `FieldBag`; el cuerpo debe ser un objeto JSON.
pub fn field_bag(value: Value) -> Result<FieldBag, CoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::validation("<body>", format!("se esperaba un objeto, llegó {other}"))),
    }
}

/// Ids existentes de programas, instrumentos y unidades en un instante dado.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSnapshot {
    pub program_ids: BTreeSet<i64>,
    pub instrument_ids: BTreeSet<i64>,
    pub unit_ids: BTreeSet<i64>,
}

impl ReferenceSnapshot {
    pub async fn load<R: MetrologyRepository + ?Sized>(repo: &R) -> Result<Self, CoreError> {
        let program_ids = repo.list_programs().await?.into_iter().map(|p| p.id).collect();
        let instrument_ids = repo.list_instruments().await?.into_iter().map(|i| i.id).collect();
        let unit_ids = repo.list_units().await?.into_iter().map(|u| u.id).collect();
        Ok(Self { program_ids, instrument_ids, unit_ids })
    }

    fn resolve(set: &BTreeSet<i64>, field: &str, id: i64) -> Result<(), CoreError> {
        if set.contains(&id) {
            Ok(())
        } else {
            Err(CoreError::unresolved(field, id))
        }
    }
}

/// Valida la definición de un paso de programa.
///
/// Orden: coerción de `programId, name, order, targetValue, usl, lsl,
/// measurementUnitId, instrumentId` (y `description` opcional); si
/// `strict_tolerances`, `lsl <= targetValue <= usl`; por último resolución de
/// `programId`, `measurementUnitId` e `instrumentId`.
pub fn validate_step_definition(bag: &FieldBag, snapshot: &ReferenceSnapshot, strict_tolerances: bool)
                                -> Result<ProgramStepDefinition, CoreError> {
    let program_id = required_int(bag, "programId")?;
    let name = required_string(bag, "name")?;
    let order = required_i32(bag, "order")?;
    let target_value = required_decimal(bag, "targetValue")?;
    let usl = required_decimal(bag, "usl")?;
    let lsl = required_decimal(bag, "lsl")?;
    let measurement_unit_id = required_int(bag, "measurementUnitId")?;
    let instrument_id = required_int(bag, "instrumentId")?;
    let description = optional_string(bag, "description")?;

    let definition = ProgramStepDefinition { program_id,
                                             order,
                                             name,
                                             description,
                                             lsl,
                                             target_value,
                                             usl,
                                             measurement_unit_id,
                                             instrument_id };
    if strict_tolerances {
        definition.check_tolerance_order()
                  .map_err(|e| CoreError::validation("targetValue", e.to_string()))?;
    }

    ReferenceSnapshot::resolve(&snapshot.program_ids, "programId", program_id)?;
    ReferenceSnapshot::resolve(&snapshot.unit_ids, "measurementUnitId", measurement_unit_id)?;
    ReferenceSnapshot::resolve(&snapshot.instrument_ids, "instrumentId", instrument_id)?;
    Ok(definition)
}

/// Valida el envío de un instrumento. Sólo `measurementUnitId` es clave
/// foránea.
pub fn validate_instrument(bag: &FieldBag, snapshot: &ReferenceSnapshot) -> Result<InstrumentDefinition, CoreError> {
    let definition = InstrumentDefinition { name: required_string(bag, "name")?,
                                            manufacturer: required_string(bag, "manufacturer")?,
                                            model: required_string(bag, "model")?,
                                            serial_number: required_string(bag, "serialNumber")?,
                                            accuracy: required_decimal(bag, "accuracy")?,
                                            resolution: required_decimal(bag, "resolution")?,
                                            lower_limit: required_decimal(bag, "lowerLimit")?,
                                            upper_limit: required_decimal(bag, "upperLimit")?,
                                            measurement_unit_id: required_int(bag, "measurementUnitId")?,
                                            location: required_string(bag, "location")?,
                                            calibration_date: required_date(bag, "calibrationDate")?,
                                            verification_date: required_date(bag, "verificationDate")?,
                                            verification_due_date: required_date(bag, "verificationDueDate")?,
                                            notes: optional_string(bag, "notes")? };
    ReferenceSnapshot::resolve(&snapshot.unit_ids, "measurementUnitId", definition.measurement_unit_id)?;
    Ok(definition)
}

pub fn validate_unit(bag: &FieldBag) -> Result<UnitDefinition, CoreError> {
    Ok(UnitDefinition { name: string_allow_empty(bag, "name")?,
                        symbol: string_allow_empty(bag, "symbol")? })
}

pub fn validate_program_fields(bag: &FieldBag) -> Result<ProgramFields, CoreError> {
    Ok(ProgramFields { name: string_allow_empty(bag, "name")?,
                       description: optional_string(bag, "description")? })
}

/// Parche de registro de paso: `realValue` y `status`, ambos opcionales.
pub fn validate_step_record_patch(bag: &FieldBag) -> Result<StepRecordPatch, CoreError> {
    let real_value = optional_decimal(bag, "realValue")?;
    let status = optional_string(bag, "status")?.map(|raw| raw.parse::<StepStatus>())
                                                .transpose()
                                                .map_err(|e| CoreError::validation("status", e.to_string()))?;
    Ok(StepRecordPatch { real_value, status })
}

/// Validador con acceso al repositorio: toma una fotografía de referencias y
/// valida de forma pura sobre ella. Sin efectos secundarios.
pub struct ReferentialValidator<R: MetrologyRepository> {
    repo: Arc<R>,
    strict_tolerances: bool,
}

impl<R: MetrologyRepository> ReferentialValidator<R> {
    pub fn new(repo: Arc<R>, strict_tolerances: bool) -> Self {
        Self { repo, strict_tolerances }
    }

    pub async fn snapshot(&self) -> Result<ReferenceSnapshot, CoreError> {
        ReferenceSnapshot::load(self.repo.as_ref()).await
    }

    pub async fn validate_step_definition(&self, bag: &FieldBag) -> Result<ProgramStepDefinition, CoreError> {
        let snapshot = self.snapshot().await?;
        validate_step_definition(bag, &snapshot, self.strict_tolerances)
    }

    pub async fn validate_instrument(&self, bag: &FieldBag) -> Result<InstrumentDefinition, CoreError> {
        let snapshot = self.snapshot().await?;
        validate_instrument(bag, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> ReferenceSnapshot {
        ReferenceSnapshot { program_ids: [1].into_iter().collect(),
                            instrument_ids: [5].into_iter().collect(),
                            unit_ids: [7].into_iter().collect() }
    }

    fn step_bag(overrides: Value) -> FieldBag {
        let mut base = field_bag(json!({
            "programId": "1",
            "name": "diámetro exterior",
            "order": "1",
            "targetValue": "2",
            "usl": "3",
            "lsl": "1",
            "measurementUnitId": "7",
            "instrumentId": "5"
        })).unwrap();
        if let Value::Object(extra) = overrides {
            base.extend(extra);
        }
        base
    }

    #[test]
    fn coerces_form_encoded_step() {
        let def = validate_step_definition(&step_bag(json!({})), &snapshot(), true).unwrap();
        assert_eq!(def.program_id, 1);
        assert_eq!(def.order, 1);
        assert_eq!((def.lsl, def.target_value, def.usl), (1.0, 2.0, 3.0));
        assert_eq!(def.description, None);
    }

    #[test]
    fn coercion_failure_names_field() {
        let err = validate_step_definition(&step_bag(json!({"usl": "mucho"})), &snapshot(), true).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "usl"), "{err:?}");
        let err = validate_step_definition(&step_bag(json!({"name": null})), &snapshot(), true).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "name"), "{err:?}");
    }

    #[test]
    fn unresolved_instrument_is_referential() {
        let err = validate_step_definition(&step_bag(json!({"instrumentId": 9999})), &snapshot(), true).unwrap_err();
        assert_eq!(err, CoreError::unresolved("instrumentId", 9999));
        let err = validate_step_definition(&step_bag(json!({"measurementUnitId": 8})), &snapshot(), true).unwrap_err();
        assert_eq!(err, CoreError::unresolved("measurementUnitId", 8));
        let err = validate_step_definition(&step_bag(json!({"programId": 2})), &snapshot(), true).unwrap_err();
        assert_eq!(err, CoreError::unresolved("programId", 2));
    }

    #[test]
    fn tolerance_order_only_when_strict() {
        let inverted = step_bag(json!({"lsl": 3, "usl": 1}));
        assert!(matches!(validate_step_definition(&inverted, &snapshot(), true),
                         Err(CoreError::Validation { ref field, .. }) if field == "targetValue"));
        assert!(validate_step_definition(&inverted, &snapshot(), false).is_ok());
    }

    #[test]
    fn instrument_fields_and_unit_reference() {
        let bag = field_bag(json!({
            "name": "Micrómetro",
            "manufacturer": "Mitutoyo",
            "model": "293-240",
            "serialNumber": 77812,
            "accuracy": "0.001",
            "resolution": 0.001,
            "lowerLimit": 0,
            "upperLimit": 25,
            "measurementUnitId": 7,
            "location": "Lab 2",
            "calibrationDate": "2024-01-10",
            "verificationDate": "2024-01-11",
            "verificationDueDate": "2025-01-11",
            "notes": null
        })).unwrap();
        let def = validate_instrument(&bag, &snapshot()).unwrap();
        assert_eq!(def.serial_number, "77812");
        assert_eq!(def.notes, None);

        let mut wrong_unit = bag.clone();
        wrong_unit.insert("measurementUnitId".into(), json!(70));
        assert_eq!(validate_instrument(&wrong_unit, &snapshot()).unwrap_err(),
                   CoreError::unresolved("measurementUnitId", 70));

        let mut bad_date = bag;
        bad_date.insert("verificationDueDate".into(), json!("mañana"));
        assert!(matches!(validate_instrument(&bad_date, &snapshot()),
                         Err(CoreError::Validation { ref field, .. }) if field == "verificationDueDate"));
    }

    #[test]
    fn step_record_patch_from_bag() {
        let patch = validate_step_record_patch(&field_bag(json!({"status": "Done", "realValue": "1.998"})).unwrap()).unwrap();
        assert_eq!(patch, StepRecordPatch { real_value: Some(1.998), status: Some(StepStatus::Done) });
        let empty = validate_step_record_patch(&field_bag(json!({"other": 1})).unwrap()).unwrap();
        assert!(empty.is_empty());
        let err = validate_step_record_patch(&field_bag(json!({"status": "Skipped"})).unwrap()).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "status"));
    }

    #[test]
    fn body_must_be_object() {
        assert!(field_bag(json!([1, 2])).is_err());
    }
}
