/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/ingest/mod.rs
 *
 * The shared machinery of the log ingestion pipeline: the ingestion context
 * (credential store, progress sink, spill file, tuning knobs), the
 * time-shard planner, the exponential backoff schedule, and the spill file
 * that serializes fetched events to JSON lines under a file-level lock.
 *
 * Each provider module drives the same shape of pipeline: plan fixed-width
 * shards over the ingestion window, fetch them under a bounded semaphore
 * with per-page retries, append events to the spill file, and fail fast on
 * the first non-retryable error. Ordering across shards is not preserved;
 * the only guarantee is that every event in the window reaches the spill
 * file before normalization starts.
 *
 * SPDX-License-Identifier: Apache-2.0 */

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod local;
pub mod progress;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::auth::CredentialStore;
use crate::config::Settings;
use crate::error::Result;
use progress::Progress;

/// Default shard concurrency per provider.
pub const AWS_CONCURRENCY: usize = 12;
pub const GCP_CONCURRENCY: usize = 4;

/// Shard widths per provider.
pub fn aws_shard_width() -> Duration {
    Duration::hours(12)
}

pub fn azure_shard_width() -> Duration {
    Duration::hours(1)
}

pub fn gcp_shard_width() -> Duration {
    Duration::hours(6)
}

/// Everything a provider fetcher needs, passed explicitly so the pipeline
/// holds no global state.
pub struct IngestionContext {
    pub settings: Settings,
    pub progress: Progress,
    pub credentials: Arc<CredentialStore>,
    pub http: reqwest::Client,
}

impl IngestionContext {
    pub fn new(settings: Settings, progress: Progress, credentials: Arc<CredentialStore>) -> Self {
        Self {
            settings,
            progress,
            credentials,
            http: reqwest::Client::new(),
        }
    }

    /// The ingestion window `[now - KIEMPOSSIBLE_LOG_DAYS, now]`.
    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc::now();
        (end - Duration::days(self.settings.log_days), end)
    }
}

/// One half-open time slice `[start, end)` of the ingestion window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Splits `[start, end)` into fixed-width shards; the last shard is clamped
/// to the window end.
pub fn plan_shards(start: DateTime<Utc>, end: DateTime<Utc>, width: Duration) -> Vec<Shard> {
    let mut shards = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let shard_end = std::cmp::min(cursor + width, end);
        shards.push(Shard {
            start: cursor,
            end: shard_end,
        });
        cursor = cursor + width;
    }
    shards
}

/// Backoff delay for the given attempt: `100ms * 2^attempt` plus up to
/// 100 ms of jitter.
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    let base = 100u64 << attempt;
    let jitter = rand::thread_rng().gen_range(0..100);
    std::time::Duration::from_millis(base + jitter)
}

/// The temp file raw events are spilled into, one JSON document per line.
/// Appends are serialized by the internal lock; the buffered writer is
/// flushed after every append batch so an aborted pipeline leaves a
/// readable file behind for debugging.
pub struct SpillFile {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl SpillFile {
    /// Creates the spill file in the system temp directory.
    pub async fn create(prefix: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "{}_{}.json",
            prefix,
            std::process::id()
        ));
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line per serialized event, atomically with respect to
    /// other shard tasks.
    pub async fn append_lines<I, S>(&self, lines: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut writer = self.writer.lock().await;
        for line in lines {
            writer.write_all(line.as_ref().as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Final flush once every shard has completed.
    pub async fn finish(&self) -> Result<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }

    /// Removes the file after successful normalization.
    pub async fn remove(&self) -> Result<()> {
        tokio::fs::remove_file(&self.path).await?;
        Ok(())
    }
}
