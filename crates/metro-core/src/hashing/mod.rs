//! Módulo de hashing y canonicalización JSON.

pub mod canonical_json;

pub use canonical_json::to_canonical_json;

use blake3::Hasher;
use metro_domain::ProgramStepDefinition;
use serde_json::json;

/// Huella de la definición de un paso: hash del JSON canónico de los campos
/// que determinan cómo se mide (límites, orden, instrumento, unidad).
///
/// Se copia en cada `StepRecord` al instanciar la corrida para poder detectar
/// después si la plantilla cambió.
pub fn fingerprint_step_definition(def: &ProgramStepDefinition) -> String {
    let value = json!({
        "program_id": def.program_id,
        "order": def.order,
        "name": def.name,
        "lsl": def.lsl,
        "target_value": def.target_value,
        "usl": def.usl,
        "measurement_unit_id": def.measurement_unit_id,
        "instrument_id": def.instrument_id,
    });
    let mut hasher = Hasher::new();
    hasher.update(to_canonical_json(&value).as_bytes());
    hasher.finalize().to_hex().to_string()
}
