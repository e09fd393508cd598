/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/error.rs
 *
 * Crate-wide error type. Provider errors carry enough classification for the
 * ingestion retry loops to distinguish throttling and expired credentials
 * from fatal failures.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("provider throttled the request: {0}")]
    Throttled(String),

    #[error("provider credentials expired: {0}")]
    ExpiredCredentials(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("max retries exceeded")]
    RetriesExhausted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("an unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
