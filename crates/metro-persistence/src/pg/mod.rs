//! Implementación Postgres (Diesel) de `MetrologyRepository`.
//!
//! - Paridad 1:1 con `InMemoryRepository`: mismos órdenes de listado, mismas
//!   restricciones de borrado (aquí las imponen las claves foráneas).
//! - Diesel es síncrono: cada operación toma una conexión del pool y corre en
//!   `tokio::task::spawn_blocking`.
//! - Las escrituras multi-fila (corrida con sus registros, borrado de programa
//!   con sus pasos, borrado de corrida con sus registros) corren en una única
//!   transacción `read_write`.
//! - La política de estados se aplica con un `UPDATE` condicionado al estado
//!   vigente, no con una lectura previa.
//! - Sin reintentos: cualquier falla se propaga como `CoreError::Persistence`.
pub mod rows;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::{debug, warn};
use uuid::Uuid;

use metro_core::{CoreError, DependencyTarget, MetrologyRepository, ProgramUpsert, StatusPolicy};
use metro_domain::{Instrument, InstrumentDefinition, MeasurementProgram, MeasurementRun, MeasurementUnit, Operator,
                   OperatorRegistration, ProgramStep, ProgramStepDefinition, StepRecord, StepRecordDraft,
                   StepRecordPatch, StepStatus, UnitDefinition};

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::{instruments, measurement_programs, measurement_runs, measurement_units, operators, program_steps,
                    step_records};
use rows::{records_from_rows, InstrumentRow, InstrumentValues, NewOperatorRow, NewProgramRow, NewRecordRow, NewRunRow,
           OperatorRow, ProgramChanges, ProgramRow, RecordChanges, RecordRow, RunRow, StepRow, StepValues, UnitRow,
           UnitValues};

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub type PooledPg = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Contrato: devuelve una conexión válida o `PersistenceError::TransientIo`.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PooledPg, PersistenceError>;
}

/// Implementación concreta de `ConnectionProvider` respaldada por un `PgPool`.
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PooledPg, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

/// Resultado de un `UPDATE` condicionado sobre `step_records`.
enum RecordWrite {
    Written(RecordRow),
    Missing,
    Rejected(String),
}

fn insert_records(conn: &mut PgConnection, run_id: i64, drafts: &[StepRecordDraft])
                  -> Result<Vec<StepRecord>, PersistenceError> {
    if drafts.is_empty() {
        return Ok(Vec::new());
    }
    let values: Vec<NewRecordRow<'_>> = drafts.iter().map(|d| NewRecordRow::new(run_id, d)).collect();
    let rows: Vec<RecordRow> = diesel::insert_into(step_records::table).values(&values)
                                                                        .returning(RecordRow::as_returning())
                                                                        .get_results(conn)?;
    let mut records = records_from_rows(rows)?;
    records.sort_by_key(|r| r.id);
    Ok(records)
}

/// Repositorio Postgres.
pub struct PgRepository<P: ConnectionProvider> {
    provider: Arc<P>,
}

impl<P: ConnectionProvider> Clone for PgRepository<P> {
    fn clone(&self) -> Self {
        Self { provider: self.provider.clone() }
    }
}

impl<P: ConnectionProvider> PgRepository<P> {
    pub fn new(provider: P) -> Self {
        Self { provider: Arc::new(provider) }
    }

    /// Corre `f` con una conexión del pool fuera del runtime async.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, CoreError>
        where T: Send + 'static,
              F: FnOnce(&mut PgConnection) -> Result<T, PersistenceError> + Send + 'static
    {
        let provider = self.provider.clone();
        let joined = tokio::task::spawn_blocking(move || {
                         let mut conn = provider.connection()?;
                         f(&mut conn)
                     }).await
                       .map_err(|e| CoreError::Persistence(format!("{op}: tarea bloqueante abortada: {e}")))?;
        joined.map_err(|e| {
                  warn!("pg:{op} error={e}");
                  CoreError::from(e)
              })
    }

    /// Alta de operador (administración / sembrado). `user_id` es único.
    pub async fn register_operator(&self, registration: OperatorRegistration) -> Result<Operator, CoreError> {
        self.with_conn("register_operator", move |conn| {
                let row: OperatorRow = diesel::insert_into(operators::table)
                    .values(NewOperatorRow::from(&registration))
                    .returning(OperatorRow::as_returning())
                    .get_result(conn)?;
                Ok(row.into())
            })
            .await
    }
}

#[async_trait]
impl<P: ConnectionProvider> MetrologyRepository for PgRepository<P> {
    async fn list_programs(&self) -> Result<Vec<MeasurementProgram>, CoreError> {
        self.with_conn("list_programs", |conn| {
                let rows: Vec<ProgramRow> = measurement_programs::table.order(measurement_programs::id.asc())
                                                                       .select(ProgramRow::as_select())
                                                                       .load(conn)?;
                Ok(rows.into_iter().map(Into::into).collect())
            })
            .await
    }

    async fn get_program(&self, id: i64) -> Result<Option<MeasurementProgram>, CoreError> {
        self.with_conn("get_program", move |conn| {
                let row: Option<ProgramRow> = measurement_programs::table.find(id)
                                                                         .select(ProgramRow::as_select())
                                                                         .first(conn)
                                                                         .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn upsert_program(&self, upsert: ProgramUpsert) -> Result<MeasurementProgram, CoreError> {
        self.with_conn("upsert_program", move |conn| {
                let ProgramUpsert { id, fields, updated_at } = upsert;
                let row: ProgramRow = match id {
                    None => diesel::insert_into(measurement_programs::table)
                        .values(NewProgramRow { name: &fields.name,
                                                description: fields.description.as_deref(),
                                                created_at: updated_at,
                                                updated_at })
                        .returning(ProgramRow::as_returning())
                        .get_result(conn)?,
                    Some(id) => diesel::update(measurement_programs::table.find(id))
                        .set(ProgramChanges::new(&fields, updated_at))
                        .returning(ProgramRow::as_returning())
                        .get_result(conn)?,
                };
                Ok(row.into())
            })
            .await
    }

    async fn delete_program(&self, id: i64) -> Result<bool, CoreError> {
        self.with_conn("delete_program", move |conn| {
                conn.build_transaction().read_write().run(|tx| {
                    diesel::delete(program_steps::table.filter(program_steps::program_id.eq(id))).execute(tx)?;
                    let n = diesel::delete(measurement_programs::table.find(id)).execute(tx)?;
                    Ok::<bool, PersistenceError>(n > 0)
                })
            })
            .await
    }

    async fn list_program_steps(&self, program_id: i64) -> Result<Vec<ProgramStep>, CoreError> {
        self.with_conn("list_program_steps", move |conn| {
                let rows: Vec<StepRow> = program_steps::table.filter(program_steps::program_id.eq(program_id))
                                                             .order((program_steps::step_order.asc(),
                                                                     program_steps::id.asc()))
                                                             .select(StepRow::as_select())
                                                             .load(conn)?;
                Ok(rows.into_iter().map(Into::into).collect())
            })
            .await
    }

    async fn get_program_step(&self, id: i64) -> Result<Option<ProgramStep>, CoreError> {
        self.with_conn("get_program_step", move |conn| {
                let row: Option<StepRow> = program_steps::table.find(id)
                                                               .select(StepRow::as_select())
                                                               .first(conn)
                                                               .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn insert_program_step(&self, definition: &ProgramStepDefinition) -> Result<ProgramStep, CoreError> {
        let definition = definition.clone();
        self.with_conn("insert_program_step", move |conn| {
                let row: StepRow = diesel::insert_into(program_steps::table)
                    .values(StepValues::from(&definition))
                    .returning(StepRow::as_returning())
                    .get_result(conn)?;
                Ok(row.into())
            })
            .await
    }

    async fn update_program_step(&self, id: i64, definition: &ProgramStepDefinition)
                                 -> Result<Option<ProgramStep>, CoreError> {
        let definition = definition.clone();
        self.with_conn("update_program_step", move |conn| {
                let row: Option<StepRow> = diesel::update(program_steps::table.find(id))
                    .set(StepValues::from(&definition))
                    .returning(StepRow::as_returning())
                    .get_result(conn)
                    .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn delete_program_step(&self, id: i64) -> Result<bool, CoreError> {
        self.with_conn("delete_program_step", move |conn| {
                Ok(diesel::delete(program_steps::table.find(id)).execute(conn)? > 0)
            })
            .await
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>, CoreError> {
        self.with_conn("list_instruments", |conn| {
                let rows: Vec<InstrumentRow> = instruments::table.order(instruments::id.asc())
                                                                 .select(InstrumentRow::as_select())
                                                                 .load(conn)?;
                Ok(rows.into_iter().map(Into::into).collect())
            })
            .await
    }

    async fn get_instrument(&self, id: i64) -> Result<Option<Instrument>, CoreError> {
        self.with_conn("get_instrument", move |conn| {
                let row: Option<InstrumentRow> = instruments::table.find(id)
                                                                   .select(InstrumentRow::as_select())
                                                                   .first(conn)
                                                                   .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn insert_instrument(&self, definition: &InstrumentDefinition) -> Result<Instrument, CoreError> {
        let definition = definition.clone();
        self.with_conn("insert_instrument", move |conn| {
                let row: InstrumentRow = diesel::insert_into(instruments::table)
                    .values(InstrumentValues::from(&definition))
                    .returning(InstrumentRow::as_returning())
                    .get_result(conn)?;
                Ok(row.into())
            })
            .await
    }

    async fn update_instrument(&self, id: i64, definition: &InstrumentDefinition)
                               -> Result<Option<Instrument>, CoreError> {
        let definition = definition.clone();
        self.with_conn("update_instrument", move |conn| {
                let row: Option<InstrumentRow> = diesel::update(instruments::table.find(id))
                    .set(InstrumentValues::from(&definition))
                    .returning(InstrumentRow::as_returning())
                    .get_result(conn)
                    .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn delete_instrument(&self, id: i64) -> Result<bool, CoreError> {
        self.with_conn("delete_instrument", move |conn| {
                Ok(diesel::delete(instruments::table.find(id)).execute(conn)? > 0)
            })
            .await
    }

    async fn list_units(&self) -> Result<Vec<MeasurementUnit>, CoreError> {
        self.with_conn("list_units", |conn| {
                let rows: Vec<UnitRow> = measurement_units::table.order((measurement_units::name.asc(),
                                                                         measurement_units::id.asc()))
                                                                 .select(UnitRow::as_select())
                                                                 .load(conn)?;
                Ok(rows.into_iter().map(Into::into).collect())
            })
            .await
    }

    async fn get_unit(&self, id: i64) -> Result<Option<MeasurementUnit>, CoreError> {
        self.with_conn("get_unit", move |conn| {
                let row: Option<UnitRow> = measurement_units::table.find(id)
                                                                   .select(UnitRow::as_select())
                                                                   .first(conn)
                                                                   .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn insert_unit(&self, definition: &UnitDefinition) -> Result<MeasurementUnit, CoreError> {
        let definition = definition.clone();
        self.with_conn("insert_unit", move |conn| {
                let row: UnitRow = diesel::insert_into(measurement_units::table)
                    .values(UnitValues::from(&definition))
                    .returning(UnitRow::as_returning())
                    .get_result(conn)?;
                Ok(row.into())
            })
            .await
    }

    async fn update_unit(&self, id: i64, definition: &UnitDefinition) -> Result<Option<MeasurementUnit>, CoreError> {
        let definition = definition.clone();
        self.with_conn("update_unit", move |conn| {
                let row: Option<UnitRow> = diesel::update(measurement_units::table.find(id))
                    .set(UnitValues::from(&definition))
                    .returning(UnitRow::as_returning())
                    .get_result(conn)
                    .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn delete_unit(&self, id: i64) -> Result<bool, CoreError> {
        self.with_conn("delete_unit", move |conn| {
                Ok(diesel::delete(measurement_units::table.find(id)).execute(conn)? > 0)
            })
            .await
    }

    async fn find_operator_by_user_id(&self, user_id: Uuid) -> Result<Option<Operator>, CoreError> {
        self.with_conn("find_operator_by_user_id", move |conn| {
                let row: Option<OperatorRow> = operators::table.filter(operators::user_id.eq(user_id))
                                                               .select(OperatorRow::as_select())
                                                               .first(conn)
                                                               .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn insert_run(&self, program_id: i64, started_at: DateTime<Utc>) -> Result<MeasurementRun, CoreError> {
        self.with_conn("insert_run", move |conn| {
                let row: RunRow = diesel::insert_into(measurement_runs::table)
                    .values(NewRunRow { program_id, started_at })
                    .returning(RunRow::as_returning())
                    .get_result(conn)?;
                debug!("pg:insert_run id={} program_id={program_id}", row.id);
                Ok(row.into())
            })
            .await
    }

    async fn get_run(&self, id: i64) -> Result<Option<MeasurementRun>, CoreError> {
        self.with_conn("get_run", move |conn| {
                let row: Option<RunRow> = measurement_runs::table.find(id)
                                                                 .select(RunRow::as_select())
                                                                 .first(conn)
                                                                 .optional()?;
                Ok(row.map(Into::into))
            })
            .await
    }

    async fn list_runs(&self) -> Result<Vec<MeasurementRun>, CoreError> {
        self.with_conn("list_runs", |conn| {
                let rows: Vec<RunRow> = measurement_runs::table.order(measurement_runs::id.asc())
                                                               .select(RunRow::as_select())
                                                               .load(conn)?;
                Ok(rows.into_iter().map(Into::into).collect())
            })
            .await
    }

    async fn delete_run(&self, id: i64) -> Result<bool, CoreError> {
        self.with_conn("delete_run", move |conn| {
                conn.build_transaction().read_write().run(|tx| {
                    diesel::delete(step_records::table.filter(step_records::measurement_run_id.eq(id))).execute(tx)?;
                    let n = diesel::delete(measurement_runs::table.find(id)).execute(tx)?;
                    Ok::<bool, PersistenceError>(n > 0)
                })
            })
            .await
    }

    async fn insert_run_with_records(&self, program_id: i64, started_at: DateTime<Utc>,
                                     drafts: Vec<StepRecordDraft>)
                                     -> Result<(MeasurementRun, Vec<StepRecord>), CoreError> {
        self.with_conn("insert_run_with_records", move |conn| {
                conn.build_transaction().read_write().run(|tx| {
                    let run: RunRow = diesel::insert_into(measurement_runs::table)
                        .values(NewRunRow { program_id, started_at })
                        .returning(RunRow::as_returning())
                        .get_result(tx)?;
                    let records = insert_records(tx, run.id, &drafts)?;
                    debug!("pg:insert_run_with_records run_id={} records={}", run.id, records.len());
                    Ok::<_, PersistenceError>((MeasurementRun::from(run), records))
                })
            })
            .await
    }

    async fn insert_step_records(&self, run_id: i64, drafts: Vec<StepRecordDraft>)
                                 -> Result<Vec<StepRecord>, CoreError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn("insert_step_records", move |conn| {
                // Un solo INSERT multi-fila dentro de la transacción: todo o nada.
                let records = conn.build_transaction()
                                  .read_write()
                                  .run(|tx| insert_records(tx, run_id, &drafts))?;
                debug!("pg:insert_step_records run_id={run_id} count={}", records.len());
                Ok(records)
            })
            .await
    }

    async fn get_step_record(&self, id: i64) -> Result<Option<StepRecord>, CoreError> {
        self.with_conn("get_step_record", move |conn| {
                let row: Option<RecordRow> = step_records::table.find(id)
                                                                .select(RecordRow::as_select())
                                                                .first(conn)
                                                                .optional()?;
                row.map(StepRecord::try_from).transpose()
            })
            .await
    }

    async fn list_step_records(&self, run_id: i64) -> Result<Vec<StepRecord>, CoreError> {
        self.with_conn("list_step_records", move |conn| {
                let rows: Vec<RecordRow> = step_records::table.filter(step_records::measurement_run_id.eq(run_id))
                                                              .order(step_records::id.asc())
                                                              .select(RecordRow::as_select())
                                                              .load(conn)?;
                records_from_rows(rows)
            })
            .await
    }

    async fn update_step_record(&self, id: i64, patch: &StepRecordPatch, policy: StatusPolicy)
                                -> Result<Option<StepRecord>, CoreError> {
        let patch = *patch;
        let reopening = policy == StatusPolicy::ForwardOnly && patch.status == Some(StepStatus::Pending);
        let outcome = self.with_conn("update_step_record", move |conn| {
                              if patch.is_empty() {
                                  // Diesel rechaza un UPDATE sin columnas.
                                  let row = step_records::table.find(id)
                                                               .select(RecordRow::as_select())
                                                               .first(conn)
                                                               .optional()?;
                                  return Ok(row.map_or(RecordWrite::Missing, RecordWrite::Written));
                              }
                              conn.build_transaction().read_write().run(|tx| {
                                  let target = step_records::table.find(id);
                                  let written: Option<RecordRow> = if reopening {
                                      diesel::update(target.filter(step_records::status.ne(StepStatus::Done.as_str())))
                                          .set(RecordChanges::from(&patch))
                                          .returning(RecordRow::as_returning())
                                          .get_result(tx)
                                          .optional()?
                                  } else {
                                      diesel::update(target).set(RecordChanges::from(&patch))
                                                            .returning(RecordRow::as_returning())
                                                            .get_result(tx)
                                                            .optional()?
                                  };
                                  if let Some(row) = written {
                                      return Ok(RecordWrite::Written(row));
                                  }
                                  let current: Option<String> = step_records::table.find(id)
                                                                                   .select(step_records::status)
                                                                                   .first(tx)
                                                                                   .optional()?;
                                  Ok::<_, PersistenceError>(current.map_or(RecordWrite::Missing, RecordWrite::Rejected))
                              })
                          })
                          .await?;
        match outcome {
            RecordWrite::Written(row) => Ok(Some(StepRecord::try_from(row)?)),
            RecordWrite::Missing => Ok(None),
            RecordWrite::Rejected(current) => {
                let from = current.parse::<StepStatus>().unwrap_or(StepStatus::Done);
                Err(CoreError::illegal_transition(from, StepStatus::Pending))
            }
        }
    }

    async fn count_dependents(&self, target: DependencyTarget) -> Result<u64, CoreError> {
        self.with_conn("count_dependents", move |conn| {
                let total: i64 = match target {
                    DependencyTarget::Program(id) => measurement_runs::table.filter(measurement_runs::program_id.eq(id))
                                                                            .count()
                                                                            .get_result(conn)?,
                    DependencyTarget::ProgramStep(id) => {
                        step_records::table.filter(step_records::measurement_program_step_id.eq(id))
                                           .count()
                                           .get_result(conn)?
                    }
                    DependencyTarget::Instrument(id) => {
                        let steps: i64 = program_steps::table.filter(program_steps::instrument_id.eq(id))
                                                             .count()
                                                             .get_result(conn)?;
                        let records: i64 = step_records::table.filter(step_records::instrument_id.eq(id))
                                                              .count()
                                                              .get_result(conn)?;
                        steps + records
                    }
                    DependencyTarget::Unit(id) => {
                        let instruments: i64 = instruments::table.filter(instruments::measurement_unit_id.eq(id))
                                                                 .count()
                                                                 .get_result(conn)?;
                        let steps: i64 = program_steps::table.filter(program_steps::measurement_unit_id.eq(id))
                                                             .count()
                                                             .get_result(conn)?;
                        let records: i64 = step_records::table.filter(step_records::measurement_unit_id.eq(id))
                                                              .count()
                                                              .get_result(conn)?;
                        instruments + steps + records
                    }
                };
                Ok(u64::try_from(total).unwrap_or_default())
            })
            .await
    }
}

/// Construye un pool r2d2 y corre las migraciones pendientes.
///
/// - Tamaños en cero se elevan a 1; si `min_size > max_size`, `min = max`.
/// - Devuelve `PersistenceError::TransientIo` ante errores del pool/manager.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("build_pool: min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(final_min))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee configuración (DATABASE_URL,
/// tamaños) y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}

/// Repositorio listo para usar a partir del entorno.
pub fn repository_from_env() -> Result<PgRepository<PoolProvider>, PersistenceError> {
    Ok(PgRepository::new(PoolProvider { pool: build_dev_pool_from_env()? }))
}
