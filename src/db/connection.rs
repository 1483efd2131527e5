use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::{DedupeError, Result};

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(s) => match s.parse::<u64>() {
            Ok(v) if v > 0 => v,
            _ => {
                log::warn!("Invalid {}='{}'; using {}", name, s, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Pool size: `DEDUPE_POOL_SIZE` if set, else two connections per core capped
/// at 32.
fn compute_max_conns() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4) as u32;
    let computed = cores.saturating_mul(2).min(32);
    env_u64("DEDUPE_POOL_SIZE", computed as u64) as u32
}

pub async fn make_pool(cfg: &DatabaseConfig) -> Result<MySqlPool> {
    let max_conn = compute_max_conns();
    let min_conn = (env_u64("DEDUPE_POOL_MIN", 1) as u32).min(max_conn);
    let acquire_ms = env_u64("DEDUPE_ACQUIRE_MS", 30_000);
    log::info!(
        "Connecting to {}:{}/{} (pool max={}, min={})",
        cfg.host,
        cfg.port,
        cfg.database,
        max_conn,
        min_conn
    );
    MySqlPoolOptions::new()
        .max_connections(max_conn)
        .min_connections(min_conn)
        .acquire_timeout(Duration::from_millis(acquire_ms))
        .connect(&cfg.to_url())
        .await
        .map_err(|e| {
            DedupeError::Connectivity(format!(
                "{}:{}/{}: {}",
                cfg.host, cfg.port, cfg.database, e
            ))
        })
}
