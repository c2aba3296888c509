use metro_persistence::config::DbConfig;
use metro_persistence::pg::{build_pool, PgPool};
use once_cell::sync::Lazy;

pub static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    let cfg = match DbConfig::from_env() {
        Ok(cfg) => cfg,
        Err(_) => return None,
    };
    match build_pool(&cfg.url, 1, 2) {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("No se pudo construir pool de test: {e}");
            None
        }
    }
});

pub fn test_pool() -> Option<PgPool> {
    let pool = TEST_POOL.as_ref().cloned();
    if pool.is_none() {
        eprintln!("DATABASE_URL no definido o inaccesible: omitiendo test");
    }
    pool
}
