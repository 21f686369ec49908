use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::db::{Db, DbConfig, SafetyLevel};

/// Initialize tracing controlled by `RUST_LOG`. Safe to call many
/// times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small pages and no autowork: flushes and merges happen only when a
/// test asks for them.
pub fn manual_config() -> DbConfig {
    init_tracing();
    DbConfig {
        write_buffer: 256 * 1024,
        page_size: 512,
        block_size: 4 * 512,
        segment_ratio: 4,
        safety: SafetyLevel::Normal,
        autowork: false,
        log_size: 1024 * 1024,
    }
}

/// Autowork on with a small write buffer, so plain writes exercise the
/// whole flush/merge/checkpoint pipeline.
pub fn auto_config() -> DbConfig {
    init_tracing();
    DbConfig {
        write_buffer: 8 * 1024,
        autowork: true,
        ..manual_config()
    }
}

pub fn open(path: &Path, config: DbConfig) -> Db {
    Db::open_with(std::sync::Arc::new(crate::env::PosixEnv), path, config).unwrap()
}

pub fn key(i: u32) -> Vec<u8> {
    format!("k{i:08}").into_bytes()
}

pub fn value(i: u32) -> Vec<u8> {
    format!("value-{i:08}-{}", "x".repeat(64)).into_bytes()
}
