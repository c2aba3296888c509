//! Configuración central de la aplicación.
//! Carga variables de entorno (.env) y expone una estructura inmutable (`CONFIG`).
use once_cell::sync::Lazy;

use metro_core::CoreConfig;
use metro_persistence::{init_dotenv, DbConfig};

/// Configuración global de la aplicación.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Conexión a Postgres; `None` si `DATABASE_URL` no está definida.
    pub database: Option<DbConfig>,
    /// Políticas del core (estado, tolerancias, certificación).
    pub core: CoreConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        init_dotenv();
        Self { database: DbConfig::from_env().ok(),
               core: CoreConfig::from_env() }
    }
}

/// Instancia global perezosa de configuración, evaluada una sola vez.
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);
