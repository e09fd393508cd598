/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/ingest/aws.rs
 *
 * CloudWatch Logs ingestion for EKS clusters. The seven-day window is cut
 * into 12-hour shards fetched concurrently under a semaphore of 12; each
 * shard paginates FilterLogEvents until its token is exhausted. The
 * server-side filter pattern keeps only successful ResponseComplete audit
 * events.
 *
 * Failure handling: throttling retries with capped exponential backoff;
 * expired credentials funnel into the shared credential slot: the first
 * task to empty the slot prompts the operator, everyone else waits for the
 * fresh session and retries from attempt zero. Any other error aborts the
 * pipeline and the spill file is left behind for debugging.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::{aws_shard_width, backoff_delay, plan_shards, IngestionContext, Shard, SpillFile, AWS_CONCURRENCY};
use crate::auth::sigv4;
use crate::error::{Error, Result};

const FILTER_PATTERN: &str = r#"{ $.stage = "ResponseComplete" && $.responseStatus.code = 200 }"#;
const LOG_STREAM_PREFIX: &str = "kube-apiserver-audit-";
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterLogEventsResponse {
    #[serde(default)]
    events: Vec<serde_json::Value>,
    next_token: Option<String>,
}

/// Runs the sharded extraction and returns the spill file holding one JSON
/// event per line.
pub async fn extract_logs(ctx: Arc<IngestionContext>, cluster_name: &str) -> Result<Arc<SpillFile>> {
    let log_group = format!("/aws/eks/{}/cluster", cluster_name);
    let (start, end) = ctx.window();
    info!(%log_group, %start, %end, "ingesting AWS logs");

    let spill = Arc::new(SpillFile::create("aws_logs").await?);
    let semaphore = Arc::new(Semaphore::new(ctx.settings.concurrency_or(AWS_CONCURRENCY)));
    ctx.progress.start("cluster log chunks ingested from AWS");

    let mut tasks = JoinSet::new();
    for shard in plan_shards(start, end, aws_shard_width()) {
        let ctx = Arc::clone(&ctx);
        let spill = Arc::clone(&spill);
        let semaphore = Arc::clone(&semaphore);
        let log_group = log_group.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Provider("shard semaphore closed".into()))?;
            fetch_shard(&ctx, &spill, &log_group, shard).await
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

/// Paginates one time shard into the spill file.
async fn fetch_shard(
    ctx: &IngestionContext,
    spill: &SpillFile,
    log_group: &str,
    shard: Shard,
) -> Result<()> {
    let mut next_token: Option<String> = None;
    loop {
        let page = fetch_page_with_retry(ctx, log_group, shard, next_token.clone()).await?;

        ctx.progress.add(page.events.len() as i64);
        let lines: Vec<String> = page
            .events
            .iter()
            .map(|event| event.to_string())
            .collect();
        spill.append_lines(lines).await?;

        match page.next_token {
            Some(token) => next_token = Some(token),
            None => return Ok(()),
        }
    }
}

/// One FilterLogEvents page, retried across throttling and credential
/// expiry per the pipeline's protocol.
async fn fetch_page_with_retry(
    ctx: &IngestionContext,
    log_group: &str,
    shard: Shard,
    next_token: Option<String>,
) -> Result<FilterLogEventsResponse> {
    let mut attempt: u32 = 0;
    while attempt < MAX_ATTEMPTS {
        match fetch_page(ctx, log_group, shard, next_token.clone()).await {
            Ok(page) => return Ok(page),
            Err(Error::Throttled(message)) => {
                let delay = backoff_delay(attempt);
                warn!(%message, ?delay, "throttling detected, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(Error::ExpiredCredentials(message)) => {
                warn!(%message, "AWS credentials expired");
                if ctx.credentials.invalidate() {
                    ctx.credentials
                        .reauthenticate_interactive(&ctx.progress)
                        .await?;
                } else {
                    // Another task is reauthenticating; block until the
                    // fresh session lands.
                    ctx.credentials.current().await;
                }
                attempt = 0;
            }
            Err(other) => return Err(other),
        }
    }
    Err(Error::RetriesExhausted)
}

async fn fetch_page(
    ctx: &IngestionContext,
    log_group: &str,
    shard: Shard,
    next_token: Option<String>,
) -> Result<FilterLogEventsResponse> {
    let credentials = ctx.credentials.current().await;
    let url: reqwest::Url = format!("https://logs.{}.amazonaws.com/", credentials.region)
        .parse()
        .map_err(|e| Error::Provider(format!("invalid CloudWatch endpoint: {e}")))?;

    let mut body = json!({
        "logGroupName": log_group,
        "logStreamNamePrefix": LOG_STREAM_PREFIX,
        "startTime": shard.start.timestamp_millis(),
        "endTime": shard.end.timestamp_millis(),
        "filterPattern": FILTER_PATTERN,
    });
    if let Some(token) = next_token {
        body["nextToken"] = json!(token);
    }
    let payload = body.to_string().into_bytes();

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        "content-type",
        "application/x-amz-json-1.1".parse().unwrap(),
    );
    headers.insert(
        "x-amz-target",
        "Logs_20140328.FilterLogEvents".parse().unwrap(),
    );
    sigv4::sign_request(
        &credentials,
        "logs",
        "POST",
        &url,
        &mut headers,
        &payload,
        Utc::now(),
    );

    let response = ctx
        .http
        .post(url)
        .headers(headers)
        .body(payload)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(classify_aws_error(&text));
    }
    Ok(serde_json::from_str(&text)?)
}

/// CloudWatch error bodies carry a `__type` field; classification mirrors
/// the substrings the retry loop keys on.
pub fn classify_aws_error(body: &str) -> Error {
    if body.contains("ThrottlingException") {
        Error::Throttled(body.to_string())
    } else if body.contains("ExpiredToken") || body.contains("AccessDenied") {
        Error::ExpiredCredentials(body.to_string())
    } else {
        Error::Provider(body.to_string())
    }
}
