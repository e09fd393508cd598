/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/auth/mod.rs
 *
 * Credential handling for the three cloud providers. The AWS credentials
 * live in a swappable slot: when a shard task detects expiry, the first task
 * to invalidate the slot wins the right to reauthenticate interactively
 * while every other task blocks on the slot until fresh credentials are
 * installed. The reauth gate additionally serializes operator prompts so
 * the console is never interleaved.
 *
 * SPDX-License-Identifier: Apache-2.0 */

pub mod sigv4;

use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::error::{Error, Result};
use crate::ingest::progress::Progress;

/// A static AWS credential set.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

impl AwsCredentials {
    /// Loads from the standard environment variables. `AWS_REGION` defaults
    /// to us-east-1, matching the provider CLI's fallback.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::Config("AWS_ACCESS_KEY_ID is not set".into()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::Config("AWS_SECRET_ACCESS_KEY is not set".into()))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty());
        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
            region,
        })
    }
}

/// The shared AWS credential slot.
pub struct CredentialStore {
    slot: watch::Sender<Option<Arc<AwsCredentials>>>,
    reauth_gate: Mutex<()>,
}

impl CredentialStore {
    pub fn new(credentials: Option<AwsCredentials>) -> Self {
        let (slot, _) = watch::channel(credentials.map(Arc::new));
        Self {
            slot,
            reauth_gate: Mutex::new(()),
        }
    }

    /// Returns the current credentials, waiting while the slot is empty
    /// because another task is mid-reauthentication.
    pub async fn current(&self) -> Arc<AwsCredentials> {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(credentials) = rx.borrow().clone() {
                return credentials;
            }
            // The sender lives as long as self, so this cannot fail.
            let _ = rx.changed().await;
        }
    }

    /// Empties the slot. Returns true for the task that performed the swap;
    /// every racing task sees false and must wait on `current()` instead.
    pub fn invalidate(&self) -> bool {
        self.slot.send_if_modified(|slot| slot.take().is_some())
    }

    /// Installs fresh credentials and wakes all waiters.
    pub fn install(&self, credentials: AwsCredentials) {
        // send_replace updates the slot even while no receiver is live.
        let _ = self.slot.send_replace(Some(Arc::new(credentials)));
    }

    /// Interactive reauthentication, run by the task that won `invalidate`.
    /// The progress line is paused so the prompt is legible, and the gate
    /// serializes prompts should reauth ever be triggered again.
    pub async fn reauthenticate_interactive(&self, progress: &Progress) -> Result<()> {
        let _gate = self.reauth_gate.lock().await;
        progress.pause();

        let credentials = tokio::task::spawn_blocking(prompt_for_aws_credentials)
            .await
            .map_err(|e| Error::Other(anyhow!("reauth prompt task failed: {e}")))??;

        self.install(credentials);
        progress.resume();
        info!("AWS session updated after reauthentication");
        Ok(())
    }
}

fn prompt_for_aws_credentials() -> Result<AwsCredentials> {
    println!("AWS credentials expired. Please reauthenticate.");
    let access_key_id = prompt_line("AWS Access Key ID: ")?;
    let secret_access_key = prompt_line("AWS Secret Access Key: ")?;
    let session_token = prompt_line("AWS Session Token: ")?;
    let region = prompt_line("AWS Region: ")?;
    println!("Reauthenticating with new credentials...");
    Ok(AwsCredentials {
        access_key_id,
        secret_access_key,
        session_token: Some(session_token).filter(|t| !t.is_empty()),
        region,
    })
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{}", label);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

// --- Azure ---

#[derive(Debug, Clone)]
pub struct AzureCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Deserialize)]
struct AzureTokenResponse {
    access_token: String,
}

/// Client-credentials token for the Log Analytics API.
pub async fn azure_access_token(
    http: &reqwest::Client,
    credentials: &AzureCredentials,
) -> Result<String> {
    let url = format!(
        "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
        credentials.tenant_id
    );
    let response = http
        .post(&url)
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("scope", "https://api.loganalytics.io/.default"),
        ])
        .send()
        .await?
        .error_for_status()
        .context("Azure token endpoint returned an error status")?;
    let token: AzureTokenResponse = response.json().await?;
    Ok(token.access_token)
}

// --- GCP ---

/// An OAuth access token for the Cloud Logging API, obtained through the
/// gcloud CLI's application-default flow. When a service-account key file is
/// given it is exported for the invocation.
pub async fn gcp_access_token(credentials_file: Option<&str>) -> Result<String> {
    let mut command = tokio::process::Command::new("gcloud");
    command.args(["auth", "application-default", "print-access-token"]);
    if let Some(path) = credentials_file {
        command.env("GOOGLE_APPLICATION_CREDENTIALS", path);
    }
    let output = command
        .output()
        .await
        .context("failed to run 'gcloud'. Is the gcloud CLI installed and on PATH?")?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "gcloud token request failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_the_first_invalidation_wins() {
        let store = CredentialStore::new(Some(AwsCredentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            session_token: None,
            region: "us-east-1".into(),
        }));

        assert!(store.invalidate());
        // The slot is already empty; racing tasks lose.
        assert!(!store.invalidate());
    }

    #[tokio::test]
    async fn waiters_block_until_fresh_credentials_are_installed() {
        let store = Arc::new(CredentialStore::new(Some(AwsCredentials {
            access_key_id: "OLD".into(),
            secret_access_key: "secret".into(),
            session_token: None,
            region: "us-east-1".into(),
        })));

        assert!(store.invalidate());

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.current().await.access_key_id.clone() })
        };

        // Give the waiter a chance to park on the empty slot.
        tokio::task::yield_now().await;
        store.install(AwsCredentials {
            access_key_id: "NEW".into(),
            secret_access_key: "secret2".into(),
            session_token: None,
            region: "us-east-1".into(),
        });

        assert_eq!(waiter.await.unwrap(), "NEW");
    }
}
