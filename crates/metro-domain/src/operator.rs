use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persona certificada que ejecuta corridas. `user_id` enlaza 1:1 con el
/// principal del proveedor de identidad externo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: i64,
    pub user_id: Uuid,
    pub certification_number: String,
    pub certification_date: NaiveDate,
    pub certification_expiry_date: NaiveDate,
}

impl Operator {
    /// `true` si `day` cae dentro de la ventana de certificación (inclusive).
    pub fn is_certified_on(&self, day: NaiveDate) -> bool {
        self.certification_date <= day && day <= self.certification_expiry_date
    }
}

/// Alta de operador. El core nunca crea operadores implícitamente; sólo la
/// usan herramientas de administración y el sembrado de pruebas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorRegistration {
    pub user_id: Uuid,
    pub certification_number: String,
    pub certification_date: NaiveDate,
    pub certification_expiry_date: NaiveDate,
}

impl OperatorRegistration {
    pub fn into_operator(self, id: i64) -> Operator {
        Operator { id,
                   user_id: self.user_id,
                   certification_number: self.certification_number,
                   certification_date: self.certification_date,
                   certification_expiry_date: self.certification_expiry_date }
    }
}

/// Identidad autenticada tal como la entrega el proveedor externo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: Uuid,
    pub email: Option<String>,
}

impl Principal {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id, email: None }
    }
}
