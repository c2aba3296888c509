use std::collections::HashMap;
use std::process::exit;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use metro_core::{CoreConfig, CoreError, Metrology};
use metro_domain::{Principal, StepRecordPatch, StepStatus};
use metro_persistence::{PgRepository, PoolProvider};

const USAGE: &str = "Uso:
  metro-cli instantiate --program <ID> --user <UUID>
  metro-cli record --id <ID> [--status Pending|Done] [--value <X>]
  metro-cli sheet --run <ID>
  metro-cli drift --run <ID>";

/// `--flag valor` a mapa; flags sin valor o desconocidas se ignoran.
fn parse_flags(args: &[String]) -> HashMap<&str, &str> {
    let mut flags = HashMap::new();
    let mut i = 0;
    while i < args.len() {
        if let Some(name) = args[i].strip_prefix("--") {
            if let Some(value) = args.get(i + 1) {
                flags.insert(name, value.as_str());
                i += 1;
            }
        }
        i += 1;
    }
    flags
}

fn usage(cmd: &str, detail: &str) -> ! {
    eprintln!("[metro {cmd}] {detail}\n{USAGE}");
    exit(2);
}

fn id_flag(cmd: &str, flags: &HashMap<&str, &str>, name: &str) -> i64 {
    match flags.get(name).map(|v| v.parse::<i64>()) {
        Some(Ok(id)) => id,
        Some(Err(_)) => usage(cmd, &format!("--{name} debe ser entero")),
        None => usage(cmd, &format!("falta --{name}")),
    }
}

/// 4: rechazo del dominio (entidad ausente, validación, referencias,
/// autorización). 5: falla del store.
fn exit_code(err: &CoreError) -> i32 {
    match err {
        CoreError::Persistence(_) => 5,
        _ => 4,
    }
}

fn print_json<T: Serialize>(cmd: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(out) => println!("{out}"),
        Err(e) => {
            eprintln!("[metro {cmd}] error serializando salida: {e}");
            exit(5);
        }
    }
}

fn finish<T: Serialize>(cmd: &str, result: Result<T, CoreError>) -> ! {
    match result {
        Ok(value) => {
            print_json(cmd, &value);
            exit(0);
        }
        Err(e) => {
            eprintln!("[metro {cmd}] {e}");
            exit(exit_code(&e));
        }
    }
}

#[tokio::main]
async fn main() {
    // Cargar .env si existe para obtener DATABASE_URL
    let _ = dotenvy::dotenv();
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else { usage("-", "falta el comando") };
    if !matches!(cmd, "instantiate" | "record" | "sheet" | "drift") {
        usage(cmd, "comando desconocido");
    }
    let flags = parse_flags(&args[2..]);

    let repo = match metro_persistence::repository_from_env() {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            eprintln!("[metro {cmd}] pool error: {e}");
            exit(5);
        }
    };
    let core: Metrology<PgRepository<PoolProvider>> = Metrology::new(repo, &CoreConfig::from_env());

    match cmd {
        "instantiate" => {
            let program_id = id_flag(cmd, &flags, "program");
            let user = match flags.get("user").map(|v| Uuid::parse_str(v)) {
                Some(Ok(user)) => user,
                Some(Err(_)) => usage(cmd, "--user debe ser un UUID"),
                None => usage(cmd, "falta --user"),
            };
            finish(cmd, core.runs.instantiate_with_records(program_id, &Principal::new(user)).await)
        }
        "record" => {
            let id = id_flag(cmd, &flags, "id");
            let status = match flags.get("status").map(|v| v.parse::<StepStatus>()) {
                Some(Ok(s)) => Some(s),
                Some(Err(e)) => usage(cmd, &e.to_string()),
                None => None,
            };
            let real_value = match flags.get("value").map(|v| v.parse::<f64>()) {
                Some(Ok(v)) => Some(v),
                Some(Err(_)) => usage(cmd, "--value debe ser numérico"),
                None => None,
            };
            finish(cmd, core.records.update_step_record(id, StepRecordPatch { real_value, status }).await)
        }
        "sheet" => {
            let run_id = id_flag(cmd, &flags, "run");
            finish(cmd, core.records.run_sheet(run_id).await)
        }
        _ => {
            let run_id = id_flag(cmd, &flags, "run");
            finish(cmd, core.runs.binding_drift(run_id).await)
        }
    }
}
