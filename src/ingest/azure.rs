/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/ingest/azure.rs
 *
 * Log Analytics ingestion for AKS clusters. One-hour shards, concurrency
 * auto-sized from the CPU count (clamped to [4, 16]) unless overridden.
 * Each shard runs one AKSAudit KQL query restricted to successful
 * ResponseComplete events; result rows are spilled as
 * `[TimeGenerated, Verb, User, ObjectRef]` JSON arrays.
 *
 * Azure has no interactive reauth path: credential failure is fatal.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

use super::{azure_shard_width, plan_shards, IngestionContext, Shard, SpillFile};
use crate::config::auto_concurrency;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    tables: Vec<Table>,
}

#[derive(Debug, Deserialize)]
struct Table {
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

fn shard_query(shard: Shard) -> String {
    format!(
        "AKSAudit\n\
         | where toint(ResponseStatus.code) >= 100 and toint(ResponseStatus.code) <= 299 and Stage == 'ResponseComplete'\n\
         | where TimeGenerated >= datetime({})\n\
         | where TimeGenerated < datetime({})\n\
         | project TimeGenerated, Verb, User, ObjectRef",
        shard.start.to_rfc3339(),
        shard.end.to_rfc3339()
    )
}

/// Runs the sharded extraction against the given Log Analytics workspace.
/// The bearer token is acquired by the caller before the pipeline starts.
pub async fn extract_logs(
    ctx: Arc<IngestionContext>,
    workspace_id: &str,
    access_token: &str,
) -> Result<Arc<SpillFile>> {
    let (start, end) = ctx.window();
    info!(%workspace_id, %start, %end, "ingesting Azure logs");

    let spill = Arc::new(SpillFile::create("azure_logs").await?);
    let width = ctx.settings.concurrency_or(auto_concurrency());
    let semaphore = Arc::new(Semaphore::new(width));
    ctx.progress.start("cluster log chunks ingested from Azure");

    let mut tasks = JoinSet::new();
    for shard in plan_shards(start, end, azure_shard_width()) {
        let ctx = Arc::clone(&ctx);
        let spill = Arc::clone(&spill);
        let semaphore = Arc::clone(&semaphore);
        let workspace_id = workspace_id.to_string();
        let token = access_token.to_string();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Provider("shard semaphore closed".into()))?;
            fetch_shard(&ctx, &spill, &workspace_id, &token, shard).await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::Provider(format!("shard task panicked: {e}")))?;
        if let Err(e) = result {
            tasks.abort_all();
            ctx.progress.stop();
            return Err(e);
        }
    }

    ctx.progress.stop();
    spill.finish().await?;
    Ok(spill)
}

async fn fetch_shard(
    ctx: &IngestionContext,
    spill: &SpillFile,
    workspace_id: &str,
    access_token: &str,
    shard: Shard,
) -> Result<()> {
    let url = format!(
        "https://api.loganalytics.io/v1/workspaces/{}/query",
        workspace_id
    );
    let response = ctx
        .http
        .post(&url)
        .bearer_auth(access_token)
        .json(&json!({ "query": shard_query(shard) }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Provider(format!(
            "Log Analytics query failed with {status}: {body}"
        )));
    }

    let parsed: QueryResponse = response.json().await?;
    for table in parsed.tables {
        ctx.progress.add(table.rows.len() as i64);
        let lines: Vec<String> = table
            .rows
            .iter()
            .map(|row| serde_json::Value::Array(row.clone()).to_string())
            .collect();
        spill.append_lines(lines).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn shard_queries_bound_the_time_window() {
        let shard = Shard {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap(),
        };
        let query = shard_query(shard);
        assert!(query.contains("AKSAudit"));
        assert!(query.contains("Stage == 'ResponseComplete'"));
        assert!(query.contains("TimeGenerated >= datetime(2024-03-01T10:00:00+00:00)"));
        assert!(query.contains("TimeGenerated < datetime(2024-03-01T11:00:00+00:00)"));
        assert!(query.contains("project TimeGenerated, Verb, User, ObjectRef"));
    }

    #[test]
    fn query_responses_flatten_to_row_arrays() {
        let parsed: QueryResponse = serde_json::from_str(
            r#"{"tables":[{"name":"PrimaryResult","columns":[],"rows":[["2024-03-01T10:00:00Z","get","{}","{}"]]}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.tables.len(), 1);
        assert_eq!(parsed.tables[0].rows.len(), 1);
    }
}
