//! Políticas configurables del core.
//!
//! Variables de entorno reconocidas:
//! - `METRO_STATUS_POLICY`: `forward_only` (default) | `permissive`.
//! - `METRO_STRICT_TOLERANCES`: exige `lsl <= targetValue <= usl` (default `true`).
//! - `METRO_ENFORCE_CERTIFICATION`: rechaza operadores con certificación
//!   fuera de vigencia (default `false`).

use std::env;
use std::str::FromStr;

use log::warn;

/// Regla aplicada a los cambios de `status` de un registro de paso.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusPolicy {
    /// Sólo `Pending -> Done` (y re-aplicar el mismo estado).
    #[default]
    ForwardOnly,
    /// Cualquier reasignación, incluido `Done -> Pending`.
    Permissive,
}

impl FromStr for StatusPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward_only" | "forward-only" => Ok(StatusPolicy::ForwardOnly),
            "permissive" => Ok(StatusPolicy::Permissive),
            other => Err(format!("política de estado desconocida: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub status_policy: StatusPolicy,
    pub strict_tolerances: bool,
    pub enforce_certification: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self { status_policy: StatusPolicy::ForwardOnly,
               strict_tolerances: true,
               enforce_certification: false }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self { status_policy: parse_var("METRO_STATUS_POLICY", defaults.status_policy),
               strict_tolerances: parse_var("METRO_STRICT_TOLERANCES", defaults.strict_tolerances),
               enforce_certification: parse_var("METRO_ENFORCE_CERTIFICATION", defaults.enforce_certification) }
    }

    /// Configuración que reproduce el comportamiento histórico: cualquier
    /// transición de estado y límites sin chequear.
    pub fn permissive() -> Self {
        Self { status_policy: StatusPolicy::Permissive,
               strict_tolerances: false,
               enforce_certification: false }
    }
}

fn parse_var<T>(name: &str, default: T) -> T
    where T: FromStr,
          T::Err: std::fmt::Display
{
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
                                  warn!("config:{name} valor inválido {raw:?} ({e}); usando default");
                                  default
                              }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_policy_parses_both_spellings() {
        assert_eq!("forward_only".parse::<StatusPolicy>().unwrap(), StatusPolicy::ForwardOnly);
        assert_eq!("Forward-Only".parse::<StatusPolicy>().unwrap(), StatusPolicy::ForwardOnly);
        assert_eq!("permissive".parse::<StatusPolicy>().unwrap(), StatusPolicy::Permissive);
        assert!("loose".parse::<StatusPolicy>().is_err());
    }

    #[test]
    fn defaults_are_strict_forward_only() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.status_policy, StatusPolicy::ForwardOnly);
        assert!(cfg.strict_tolerances);
        assert!(!cfg.enforce_certification);
    }

    #[test]
    fn unset_variable_uses_default() {
        assert!(parse_var::<bool>("METRO_TEST_UNSET_VARIABLE_FOR_CONFIG", true));
    }
}
