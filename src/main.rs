//! Demo de punta a punta: plantilla → corrida → mediciones → planilla.
//!
//! Corre siempre sobre el repositorio en memoria. Con el feature `pg_demo`
//! y `DATABASE_URL` definido repite el recorrido contra Postgres.
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

use metroflow_rust::config::CONFIG;
use metroflow_rust::metro_core::{field_bag, InMemoryRepository, Metrology, MetrologyRepository};
use metroflow_rust::metro_domain::{OperatorRegistration, Principal, StepStatus};
use metroflow_rust::AppError;

fn operator_for(user_id: Uuid) -> OperatorRegistration {
    OperatorRegistration { user_id,
                           certification_number: "DEMO-001".into(),
                           certification_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
                           certification_expiry_date: NaiveDate::from_ymd_opt(2999, 12, 31).unwrap_or_default() }
}

async fn walkthrough<R: MetrologyRepository>(label: &str, repo: Arc<R>, principal: &Principal) -> Result<(), AppError> {
    let core = Metrology::new(repo, &CONFIG.core);

    let unit = core.catalog.create_unit(&field_bag(json!({"name": "milímetro", "symbol": "mm"}))?).await?;
    let instrument = core.catalog
                         .create_instrument(&field_bag(json!({
                             "name": "Calibre digital",
                             "manufacturer": "Mitutoyo",
                             "model": "500-196-30",
                             "serialNumber": Uuid::new_v4().to_string(),
                             "accuracy": "0.02",
                             "resolution": "0.01",
                             "lowerLimit": "0",
                             "upperLimit": "150",
                             "measurementUnitId": unit.id,
                             "location": "Metrología",
                             "calibrationDate": "2024-02-01",
                             "verificationDate": "2024-02-02",
                             "verificationDueDate": "2025-02-02"
                         }))?)
                         .await?;
    let program = core.catalog.create_program(&field_bag(json!({"name": "Eje 40h7"}))?).await?;
    for (order, name, lsl, target, usl) in [(1, "diámetro", 39.975, 40.0, 40.0), (2, "largo", 119.8, 120.0, 120.2)] {
        core.catalog
            .add_step(&field_bag(json!({
                "programId": program.id,
                "name": name,
                "order": order,
                "lsl": lsl,
                "targetValue": target,
                "usl": usl,
                "measurementUnitId": unit.id,
                "instrumentId": instrument.id
            }))?)
            .await?;
    }

    let run = core.runs.instantiate_with_records(program.id, principal).await?;
    println!("[{label}] corrida {} con {} registros", run.run.id, run.records.len());

    for (record, value) in run.records.iter().zip([39.990, 120.31]) {
        let updated = core.records
                          .update_step_record_fields(record.id,
                                                     &field_bag(json!({"status": StepStatus::Done.as_str(),
                                                                       "realValue": value}))?)
                          .await?;
        println!("[{label}] registro {} -> {} {}", updated.id, updated.status, updated.real_value);
    }

    let sheet = core.records.run_sheet(run.run.id).await?;
    println!("[{label}] completa: {} | fuera de tolerancia: {}",
             sheet.is_complete(),
             sheet.out_of_tolerance().count());
    let drift = core.runs.binding_drift(run.run.id).await?;
    println!("[{label}] divergencias de plantilla: {}", drift.len());
    Ok(())
}

async fn in_memory_demo() -> Result<(), AppError> {
    let repo = Arc::new(InMemoryRepository::new());
    let user_id = Uuid::new_v4();
    repo.register_operator(operator_for(user_id)).await?;
    walkthrough("memoria", repo, &Principal::new(user_id)).await
}

#[cfg(feature = "pg_demo")]
async fn pg_demo() -> Result<(), AppError> {
    if CONFIG.database.is_none() {
        eprintln!("[PG DEMO] DATABASE_URL no definido; omitiendo demo PG");
        return Ok(());
    }
    let repo = Arc::new(metroflow_rust::metro_persistence::repository_from_env()?);
    let user_id = Uuid::new_v4();
    repo.register_operator(operator_for(user_id)).await?;
    walkthrough("postgres", repo, &Principal::new(user_id)).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = in_memory_demo().await {
        eprintln!("[memoria] Error: {e}");
        std::process::exit(e.exit_code());
    }
    #[cfg(feature = "pg_demo")]
    if let Err(e) = pg_demo().await {
        eprintln!("[PG DEMO] Error: {e}");
        std::process::exit(e.exit_code());
    }
}
