/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/config.rs
 *
 * Environment-variable tuning knobs. Every knob has a sensible default so
 * the tool runs with zero configuration; values that fail to parse fall back
 * to the default rather than aborting.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use std::str::FromStr;

pub const ENV_LOG_DAYS: &str = "KIEMPOSSIBLE_LOG_DAYS";
pub const ENV_LOG_CONCURRENCY: &str = "KIEMPOSSIBLE_LOG_CONCURRENCY";
pub const ENV_GCP_PAGE_SIZE: &str = "KIEMPOSSIBLE_GCP_PAGE_SIZE";
pub const ENV_UNUSED_ENTITY_DAYS: &str = "KIEMPOSSIBLE_UNUSED_ENTITY_DAYS";
pub const ENV_DB_PATH: &str = "KIEMPOSSIBLE_DB_PATH";

/// Runtime tuning derived from the process environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// How many days of audit logs to ingest, counting back from now.
    pub log_days: i64,
    /// Overrides the per-provider shard concurrency when set.
    pub log_concurrency: Option<usize>,
    /// Page size for GCP Cloud Logging queries.
    pub gcp_page_size: i64,
    /// Cutoff for the unused-roles / unused-bindings report sections.
    pub unused_entity_days: i64,
    /// Path of the SQLite database file.
    pub db_path: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            log_days: env_parse(ENV_LOG_DAYS).filter(|d| *d > 0).unwrap_or(7),
            log_concurrency: env_parse(ENV_LOG_CONCURRENCY).filter(|c| *c > 0),
            gcp_page_size: env_parse(ENV_GCP_PAGE_SIZE)
                .filter(|p| *p > 0)
                .unwrap_or(1_000_000),
            unused_entity_days: env_parse(ENV_UNUSED_ENTITY_DAYS)
                .filter(|d| *d > 0)
                .unwrap_or(7),
            db_path: std::env::var(ENV_DB_PATH).unwrap_or_else(|_| "kiempossible.db".to_string()),
        }
    }

    /// Shard concurrency for a provider: the environment override wins,
    /// otherwise the provider default.
    pub fn concurrency_or(&self, provider_default: usize) -> usize {
        self.log_concurrency.unwrap_or(provider_default)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Azure shard concurrency when no override is set: 2x the CPU count,
/// clamped to [4, 16].
pub fn auto_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus * 2).clamp(4, 16)
}
