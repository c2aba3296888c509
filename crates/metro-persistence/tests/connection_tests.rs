//! Pruebas básicas de configuración y pool (requiere DATABASE_URL válido en entorno).

use metro_persistence::{config::DbConfig, pg::build_pool};

#[test]
fn create_pool_from_env() {
    let Ok(cfg) = DbConfig::from_env() else {
        eprintln!("DATABASE_URL no definido: omitiendo test");
        return;
    };
    let pool = build_pool(&cfg.url, cfg.min_connections, cfg.max_connections).expect("pool");
    let mut conn = pool.get().expect("conn");
    use diesel::connection::SimpleConnection;
    conn.batch_execute("SELECT 1;").expect("select 1");
}

#[test]
fn pool_sizes_fall_back_to_defaults() {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL no definido: omitiendo test");
        return;
    }
    let cfg = DbConfig::from_env().expect("config");
    assert!(cfg.min_connections >= 1);
    assert!(cfg.max_connections >= 1);
}
