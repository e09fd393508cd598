/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/ingest/local.rs
 *
 * Local audit-log ingestion: streams a kube-apiserver audit file line by
 * line, keeps the lines that parse as audit events, and re-serializes them
 * compactly into the spill file. Stage/status filtering happens during
 * normalization, matching the canonical pipeline shape.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use super::{IngestionContext, SpillFile};
use crate::error::Result;

pub async fn extract_logs(ctx: Arc<IngestionContext>, log_file: &str) -> Result<Arc<SpillFile>> {
    info!(%log_file, "ingesting local logs");
    let spill = Arc::new(SpillFile::create("local_logs").await?);
    ctx.progress.start("cluster log chunks ingested from file");

    let file = File::open(log_file).await?;
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        // Unparseable lines are dropped here; valid events are re-emitted
        // compactly so every spill line is one JSON document.
        let Ok(event) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        if !event.is_object() {
            continue;
        }
        spill.append_lines([event.to_string()]).await?;
        ctx.progress.add(1);
    }

    ctx.progress.stop();
    spill.finish().await?;
    Ok(spill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialStore;
    use crate::config::Settings;
    use crate::ingest::progress::Progress;
    use std::io::Write;

    fn test_context() -> Arc<IngestionContext> {
        let settings = Settings {
            log_days: 7,
            log_concurrency: None,
            gcp_page_size: 1_000_000,
            unused_entity_days: 7,
            db_path: ":memory:".into(),
        };
        Arc::new(IngestionContext::new(
            settings,
            Progress::new(),
            Arc::new(CredentialStore::new(None)),
        ))
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_and_events_respilled() {
        let mut source = tempfile::NamedTempFile::new().unwrap();
        writeln!(source, r#"{{"verb":"get","stage":"ResponseComplete"}}"#).unwrap();
        writeln!(source, "not json at all").unwrap();
        writeln!(source, r#"{{"verb":"list","stage":"ResponseComplete"}}"#).unwrap();
        source.flush().unwrap();

        let ctx = test_context();
        let spill = extract_logs(ctx, source.path().to_str().unwrap())
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(spill.path()).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        spill.remove().await.unwrap();
    }
}
