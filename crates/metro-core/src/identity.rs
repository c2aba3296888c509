//! Resolución de la identidad autenticada a un `Operator`.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use log::{debug, warn};

use metro_domain::{Operator, Principal};

use crate::errors::{CoreError, EntityKind};
use crate::repo::MetrologyRepository;

/// Colaborador de identidad: entrega el principal autenticado, si lo hay.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_principal(&self) -> Option<Principal>;
}

/// Proveedor fijo en proceso (tests y CLI).
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    principal: Option<Principal>,
}

impl StaticIdentity {
    pub fn new(principal: Principal) -> Self {
        Self { principal: Some(principal) }
    }

    pub fn anonymous() -> Self {
        Self { principal: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_principal(&self) -> Option<Principal> {
        self.principal.clone()
    }
}

pub struct IdentityResolver<R: MetrologyRepository> {
    repo: Arc<R>,
    enforce_certification: bool,
}

impl<R: MetrologyRepository> IdentityResolver<R> {
    pub fn new(repo: Arc<R>, enforce_certification: bool) -> Self {
        Self { repo, enforce_certification }
    }

    /// Operador enlazado al principal (`Operator.userId == principal.userId`).
    ///
    /// Sin operador: `NotFound(Operator)`. Con `enforce_certification` y
    /// certificación fuera de vigencia hoy: `Authorization`.
    pub async fn resolve_operator(&self, principal: &Principal) -> Result<Operator, CoreError> {
        let operator = self.repo
                           .find_operator_by_user_id(principal.user_id)
                           .await?
                           .ok_or_else(|| CoreError::not_found(EntityKind::Operator, principal.user_id))?;
        if self.enforce_certification {
            check_certification(&operator, Utc::now().date_naive())?;
        }
        debug!("identity:resolved user_id={} operator_id={}", principal.user_id, operator.id);
        Ok(operator)
    }

    /// Principal actual del proveedor; su ausencia es `Authorization`.
    pub async fn resolve_current(&self, provider: &dyn IdentityProvider) -> Result<Principal, CoreError> {
        provider.current_principal()
                .await
                .ok_or_else(|| CoreError::Authorization("no hay principal autenticado".into()))
    }
}

fn check_certification(operator: &Operator, today: NaiveDate) -> Result<(), CoreError> {
    if operator.is_certified_on(today) {
        return Ok(());
    }
    warn!("identity:certification_rejected operator_id={} expiry={}",
          operator.id, operator.certification_expiry_date);
    Err(CoreError::Authorization(format!("certificación {} fuera de vigencia ({} .. {})",
                                         operator.certification_number,
                                         operator.certification_date,
                                         operator.certification_expiry_date)))
}
