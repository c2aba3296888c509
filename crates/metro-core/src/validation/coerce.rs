//! Coerción de valores crudos (formularios / JSON) a tipos declarados.
//!
//! Reglas:
//! - Entero: número integral o string numérico integral (`"3"`, `" 3 "`,
//!   `"1.0"`, `"1e2"`).
//! - Decimal: número o string numérico; debe ser finito.
//! - String: string, número o booleano (se convierte con `to_string`).
//! - Fecha: `YYYY-MM-DD` o marca RFC 3339 (se toma la fecha).
//! - Ausente, `null` o string en blanco en un campo requerido: error.
use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};

use crate::errors::CoreError;

pub type FieldBag = Map<String, Value>;

/// Valor presente y no vacío de `field`, o `None`.
fn present<'a>(bag: &'a FieldBag, field: &str) -> Option<&'a Value> {
    match bag.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(v) => Some(v),
    }
}

fn required<'a>(bag: &'a FieldBag, field: &str) -> Result<&'a Value, CoreError> {
    present(bag, field).ok_or_else(|| CoreError::validation(field, "campo requerido"))
}

/// Decimal integral representable como `i64`.
fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn integer_from(field: &str, value: &Value) -> Result<i64, CoreError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    };
    parsed.ok_or_else(|| CoreError::validation(field, format!("se esperaba un entero, llegó {value}")))
}

fn decimal_from(field: &str, value: &Value) -> Result<f64, CoreError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(f),
        _ => Err(CoreError::validation(field, format!("se esperaba un número finito, llegó {value}"))),
    }
}

fn string_from(field: &str, value: &Value) -> Result<String, CoreError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(CoreError::validation(field, format!("se esperaba texto, llegó {other}"))),
    }
}

pub fn required_int(bag: &FieldBag, field: &str) -> Result<i64, CoreError> {
    integer_from(field, required(bag, field)?)
}

pub fn required_i32(bag: &FieldBag, field: &str) -> Result<i32, CoreError> {
    let wide = required_int(bag, field)?;
    i32::try_from(wide).map_err(|_| CoreError::validation(field, format!("fuera de rango: {wide}")))
}

pub fn required_decimal(bag: &FieldBag, field: &str) -> Result<f64, CoreError> {
    decimal_from(field, required(bag, field)?)
}

pub fn optional_decimal(bag: &FieldBag, field: &str) -> Result<Option<f64>, CoreError> {
    present(bag, field).map(|v| decimal_from(field, v)).transpose()
}

pub fn required_string(bag: &FieldBag, field: &str) -> Result<String, CoreError> {
    string_from(field, required(bag, field)?)
}

/// Como `required_string` pero acepta el string vacío (p.ej. el nombre de un
/// programa recién creado).
pub fn string_allow_empty(bag: &FieldBag, field: &str) -> Result<String, CoreError> {
    match bag.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => required_string(bag, field),
    }
}

pub fn optional_string(bag: &FieldBag, field: &str) -> Result<Option<String>, CoreError> {
    present(bag, field).map(|v| string_from(field, v)).transpose()
}

pub fn required_date(bag: &FieldBag, field: &str) -> Result<NaiveDate, CoreError> {
    let raw = required_string(bag, field)?;
    let raw = raw.trim();
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(day);
    }
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.date_naive())
                                     .map_err(|_| CoreError::validation(field, format!("fecha inválida: {raw:?}")))
}
