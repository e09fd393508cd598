/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/ingest/gcp.rs
 *
 * Cloud Logging ingestion for GKE clusters. Six-hour shards under a
 * semaphore of 4: the logging admin API is quota-bound, and the narrow
 * slicing plus capped concurrency keeps queries inside the rate limits.
 * Rate-limit errors retry up to 6 times with exponential backoff; any other
 * error is fatal.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::{backoff_delay, gcp_shard_width, plan_shards, IngestionContext, Shard, SpillFile, GCP_CONCURRENCY};
use crate::error::{Error, Result};

const MAX_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone)]
pub struct GcpTarget {
    pub project_id: String,
    pub cluster_name: String,
    pub region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEntriesResponse {
    #[serde(default)]
    entries: Vec<serde_json::Value>,
    next_page_token: Option<String>,
}

fn shard_filter(target: &GcpTarget, shard: Shard) -> String {
    format!(
        "log_name=\"projects/{project}/logs/cloudaudit.googleapis.com%2Factivity\" AND \
         resource.type=\"k8s_cluster\" AND \
         resource.labels.cluster_name=\"{cluster}\" AND \
         resource.labels.project_id=\"{project}\" AND \
         resource.labels.location=\"{region}\" AND \
         protoPayload.status.code=0 AND \
         operation.last=true AND \
         timestamp>=\"{start}\" AND \
         timestamp<\"{end}\"",
        project = target.project_id,
        cluster = target.cluster_name,
        region = target.region,
        start = shard.start.to_rfc3339(),
        end = shard.end.to_rfc3339(),
    )
}

/// Runs the sharded extraction. The access token is acquired by the caller;
/// token expiry inside the window is fatal (no interactive reauth on GCP).
pub async fn extract_logs(
    ctx: Arc<IngestionContext>,
    target: GcpTarget,
    access_token: &str,
) -> Result<Arc<SpillFile>> {
    let (start, end) = ctx.window();
    info!(project = %target.project_id, cluster = %target.cluster_name, %start, %end, "ingesting GCP logs");

    let spill = Arc::new(SpillFile::create("gcp_logs").await?);
    let semaphore = Arc::new(Semaphore::new(ctx.settings.concurrency_or(GCP_CONCURRENCY)));
    ctx.progress.start("cluster log chunks ingested from GCP");

    let mut tasks = JoinSet::new();
    for shard in plan_shards(start, end, gcp_shard_width()) {
        let ctx = Arc::clone(&ctx);
        let spill = Arc::clone(&spill);
        let semaphore = Arc::clone(&semaphore);
        let target = target.clone();
        let token = access_token.to_string();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Provider("shard semaphore closed".into()))?;
            fetch_shard(&ctx, &spill, &target, &token, shard).await
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
    target: &GcpTarget,
    access_token: &str,
    shard: Shard,
) -> Result<()> {
    let filter = shard_filter(target, shard);
    let mut page_token: Option<String> = None;

    loop {
        let page =
            fetch_page_with_retry(ctx, target, access_token, &filter, page_token.clone()).await?;

        ctx.progress.add(page.entries.len() as i64);
        let lines: Vec<String> = page.entries.iter().map(|e| e.to_string()).collect();
        spill.append_lines(lines).await?;

        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(token) => page_token = Some(token),
            None => return Ok(()),
        }
    }
}

async fn fetch_page_with_retry(
    ctx: &IngestionContext,
    target: &GcpTarget,
    access_token: &str,
    filter: &str,
    page_token: Option<String>,
) -> Result<ListEntriesResponse> {
    let mut attempt: u32 = 0;
    loop {
        match fetch_page(ctx, target, access_token, filter, page_token.clone()).await {
            Ok(page) => return Ok(page),
            Err(Error::Throttled(message)) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(Error::RetriesExhausted);
                }
                let delay = backoff_delay(attempt);
                warn!(%message, ?delay, "GCP rate limit hit, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}

async fn fetch_page(
    ctx: &IngestionContext,
    target: &GcpTarget,
    access_token: &str,
    filter: &str,
    page_token: Option<String>,
) -> Result<ListEntriesResponse> {
    let mut body = json!({
        "resourceNames": [format!("projects/{}", target.project_id)],
        "filter": filter,
        "pageSize": ctx.settings.gcp_page_size,
    });
    if let Some(token) = page_token {
        body["pageToken"] = json!(token);
    }

    let response = ctx
        .http
        .post("https://logging.googleapis.com/v2/entries:list")
        .bearer_auth(access_token)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        if status.as_u16() == 429 || text.contains("RATE_LIMIT_EXCEEDED") {
            return Err(Error::Throttled(text));
        }
        return Err(Error::Provider(format!(
            "entries:list failed with {status}: {text}"
        )));
    }
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn shard_filters_pin_cluster_project_and_window() {
        let target = GcpTarget {
            project_id: "acme-prod".into(),
            cluster_name: "payments".into(),
            region: "us-central1".into(),
        };
        let shard = Shard {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap(),
        };
        let filter = shard_filter(&target, shard);
        assert!(filter.contains("projects/acme-prod/logs/cloudaudit.googleapis.com%2Factivity"));
        assert!(filter.contains("resource.labels.cluster_name=\"payments\""));
        assert!(filter.contains("resource.labels.location=\"us-central1\""));
        assert!(filter.contains("protoPayload.status.code=0"));
        assert!(filter.contains("operation.last=true"));
        assert!(filter.contains("timestamp>=\"2024-03-01T00:00:00+00:00\""));
    }

    #[test]
    fn empty_page_tokens_terminate_pagination() {
        let page: ListEntriesResponse =
            serde_json::from_str(r#"{"entries":[],"nextPageToken":""}"#).unwrap();
        assert!(page.next_page_token.filter(|t| !t.is_empty()).is_none());
    }
}
