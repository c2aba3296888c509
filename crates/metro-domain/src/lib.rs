// metro-domain library entry point
//
// Entidades del dominio de metrología: plantillas de programa, pasos con
// tolerancias, instrumentos, unidades, operadores, corridas y registros de
// paso. Estructuras planas serializables (camelCase en el cable) sin
// dependencia de ningún backend de almacenamiento.
pub mod error;
pub mod instrument;
pub mod operator;
pub mod program;
pub mod run;

pub use error::DomainError;
pub use instrument::{Instrument, InstrumentDefinition, MeasurementUnit, UnitDefinition};
pub use operator::{Operator, OperatorRegistration, Principal};
pub use program::{MeasurementProgram, ProgramFields, ProgramStep, ProgramStepDefinition};
pub use run::{MeasurementRun, StepRecord, StepRecordDraft, StepRecordPatch, StepStatus};
