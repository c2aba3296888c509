//! Humo de la librería raíz: los crates re-exportados alcanzan para armar una
//! corrida completa con identidad tomada del proveedor.
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

use metroflow_rust::metro_core::{field_bag, CoreConfig, CoreError, InMemoryRepository, Metrology,
                                 MetrologyRepository, StaticIdentity};
use metroflow_rust::metro_domain::{OperatorRegistration, Principal};
use metroflow_rust::AppError;

async fn program_with_one_step(core: &Metrology<InMemoryRepository>) -> i64 {
    let unit = core.catalog
                   .create_unit(&field_bag(json!({"name": "grado", "symbol": "°"})).unwrap())
                   .await
                   .unwrap();
    let instrument = core.catalog
                         .create_instrument(&field_bag(json!({
                             "name": "Goniómetro",
                             "manufacturer": "Starrett",
                             "model": "C364",
                             "serialNumber": "G-9",
                             "accuracy": 0.1,
                             "resolution": 0.1,
                             "lowerLimit": 0,
                             "upperLimit": 360,
                             "measurementUnitId": unit.id,
                             "location": "Banco 4",
                             "calibrationDate": "2024-03-01T08:00:00Z",
                             "verificationDate": "2024-03-02",
                             "verificationDueDate": "2025-03-02"
                         })).unwrap())
                         .await
                         .unwrap();
    let program = core.catalog.create_program(&field_bag(json!({"name": "Chaflán"})).unwrap()).await.unwrap();
    core.catalog
        .add_step(&field_bag(json!({
            "programId": program.id,
            "name": "ángulo",
            "order": 1,
            "lsl": 44.5,
            "targetValue": 45,
            "usl": 45.5,
            "measurementUnitId": unit.id,
            "instrumentId": instrument.id
        })).unwrap())
        .await
        .unwrap();
    program.id
}

#[tokio::test]
async fn instantiate_for_current_principal() {
    let repo = Arc::new(InMemoryRepository::new());
    let core = Metrology::new(repo.clone(), &CoreConfig::default());
    let program_id = program_with_one_step(&core).await;
    let user_id = Uuid::new_v4();
    repo.register_operator(OperatorRegistration { user_id,
                                                  certification_number: "X-1".into(),
                                                  certification_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                                                  certification_expiry_date: NaiveDate::from_ymd_opt(2999, 1, 1).unwrap() })
        .await
        .unwrap();

    let run = core.runs
                  .instantiate_for_current(program_id, &StaticIdentity::new(Principal::new(user_id)))
                  .await
                  .unwrap();
    assert_eq!(core.records.list_for_run(run.id).await.unwrap().len(), 1);

    let err = core.runs
                  .instantiate_for_current(program_id, &StaticIdentity::anonymous())
                  .await
                  .unwrap_err();
    assert!(matches!(err, CoreError::Authorization(_)));
    assert_eq!(repo.list_runs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn app_error_classifies_core_failures() {
    let repo = Arc::new(InMemoryRepository::new());
    let core = Metrology::new(repo, &CoreConfig::default());
    let err: AppError = core.runs.get_run(7).await.unwrap_err().into();
    assert_eq!(err.exit_code(), 4);
    assert!(err.to_string().contains("Measurement no encontrado: 7"), "{err}");
}
