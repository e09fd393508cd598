/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/main.rs
 *
 * Entry point. For each provider the run has the same spine:
 * 1. Connect to the cluster (current kubeconfig context) and rebuild the
 *    permission table: discovery, role maps, binding walk, optionally
 *    workload identities.
 * 2. Extract the audit-log window into a spill file through the sharded
 *    ingestion pipeline.
 * 3. Stream the spill file through the correlator, updating last-used
 *    columns (and, on EKS, expanding access policies referenced by events).
 * 4. Optionally write the advise report.
 *
 * Exit code 0 on success, 1 on argument errors and fatal pipeline errors.
 *
 * SPDX-License-Identifier: Apache-2.0 */

mod auth;
mod cli;
mod cluster;
mod config;
mod correlate;
mod error;
mod ingest;
mod normalize;
mod policies;
mod report;
mod store;

use clap::Parser;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use auth::{AwsCredentials, AzureCredentials, CredentialStore};
use cli::{AwsArgs, AzureArgs, Cli, Command, GcpArgs, LocalArgs};
use config::Settings;
use correlate::Correlator;
use error::Result;
use ingest::gcp::GcpTarget;
use ingest::progress::Progress;
use ingest::{IngestionContext, SpillFile};
use cluster::bindings;
use cluster::discovery::DiscoveryCache;
use cluster::roles;
use cluster::workloads::{ClusterFlavor, WorkloadCollector};
use normalize::providers;
use policies::AccessPolicyExpander;
use store::PermissionStore;

const BANNER: &str = r#"
 _  _____ ___ __  __ ___             _ _    _
| |/ /_ _| __|  \/  | _ \___ _______(_) |__| |___
| ' < | || _|| |\/| |  _/ _ (_-<_-< | '_ \ / -_)
|_|\_\___|___|_|  |_|_| \___/__/__/_|_.__/_\___|
"#;

#[tokio::main]
async fn main() {
    println!("{}", BANNER);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Argument errors and fatal pipeline errors both exit 1.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    let settings = Settings::from_env();
    let outcome = match cli.command {
        Command::Aws(args) => run_aws(args, settings).await,
        Command::Azure(args) => run_azure(args, settings).await,
        Command::Gcp(args) => run_gcp(args, settings).await,
        Command::Local(args) => run_local(args, settings).await,
    };

    if let Err(e) = outcome {
        error!(error = %e, "run failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Rebuilds the permission table from the cluster: discovery, role maps,
/// binding walk, and (optionally) workload identities.
async fn collect_cluster(
    client: &kube::Client,
    store: &PermissionStore,
    progress: &Progress,
    flavor: ClusterFlavor,
    collect_workloads: bool,
    eks: Option<(&Arc<CredentialStore>, &str)>,
) -> Result<DiscoveryCache> {
    let cache = DiscoveryCache::build(client).await?;
    let role_map = roles::collect_roles(client).await?;
    let cluster_role_map = roles::collect_cluster_roles(client).await?;

    store.clear_all().await?;
    println!("Calculating permissions and inserting into the database...");
    bindings::collect_cluster_role_bindings(client, store, &cache, &cluster_role_map, progress)
        .await?;
    bindings::collect_role_bindings(client, store, &cache, &role_map, &cluster_role_map, progress)
        .await?;

    if collect_workloads {
        println!("\nCollecting workload information...");
        let mut collector = WorkloadCollector::new(client.clone(), store.clone(), flavor);
        if let Some((credentials, cluster_name)) = eks {
            collector
                .load_eks_pod_identities(credentials, &reqwest::Client::new(), cluster_name)
                .await;
        }
        collector.collect(&cache.namespaces).await?;
    }

    Ok(cache)
}

async fn finish_run(
    store: &PermissionStore,
    settings: &Settings,
    spill: &SpillFile,
    advise: bool,
) -> Result<()> {
    info!("logs processed, cleaning up temp log file");
    spill.remove().await?;
    if advise {
        report::write_report(store, settings).await?;
    }
    println!("Done. Permission table rows: {}", store.permission_count().await?);
    Ok(())
}

async fn run_aws(args: AwsArgs, settings: Settings) -> Result<()> {
    let credentials = Arc::new(CredentialStore::new(Some(AwsCredentials::from_env()?)));
    let store = PermissionStore::connect(&settings.db_path).await?;
    let client = kube::Client::try_default().await?;
    let progress = Progress::new();

    let cache = collect_cluster(
        &client,
        &store,
        &progress,
        ClusterFlavor::Eks,
        args.common.collect_workloads,
        Some((&credentials, &args.cluster_name)),
    )
    .await?;

    let ctx = Arc::new(IngestionContext::new(
        settings.clone(),
        progress.clone(),
        Arc::clone(&credentials),
    ));
    let spill = ingest::aws::extract_logs(Arc::clone(&ctx), &args.cluster_name).await?;

    let mut expander = AccessPolicyExpander::new(
        store.clone(),
        Arc::clone(&credentials),
        progress.clone(),
        args.cluster_name.clone(),
        cache.namespaces.clone(),
    );
    let mut correlator = Correlator::new(&store, &progress);
    correlator
        .process_spill(spill.path(), providers::parse_aws_line, Some(&mut expander))
        .await?;

    finish_run(&store, &settings, &spill, args.common.advise).await
}

async fn run_azure(args: AzureArgs, settings: Settings) -> Result<()> {
    let azure_credentials = AzureCredentials {
        tenant_id: args.tenant_id.clone(),
        client_id: args.client_id.clone(),
        client_secret: args.client_secret.clone(),
    };
    debug!(
        cluster = args.cluster_name.as_deref().unwrap_or("<kubeconfig current>"),
        subscription = args.subscription.as_deref().unwrap_or(""),
        resource_group = args.resource_group.as_deref().unwrap_or(""),
        "auditing AKS cluster"
    );

    let store = PermissionStore::connect(&settings.db_path).await?;
    let client = kube::Client::try_default().await?;
    let progress = Progress::new();

    collect_cluster(
        &client,
        &store,
        &progress,
        ClusterFlavor::Aks,
        args.common.collect_workloads,
        None,
    )
    .await?;

    let ctx = Arc::new(IngestionContext::new(
        settings.clone(),
        progress.clone(),
        Arc::new(CredentialStore::new(None)),
    ));
    let token = auth::azure_access_token(&ctx.http, &azure_credentials).await?;
    let spill = ingest::azure::extract_logs(Arc::clone(&ctx), &args.workspace_id, &token).await?;

    let mut correlator = Correlator::new(&store, &progress);
    correlator
        .process_spill(spill.path(), providers::parse_azure_line, None)
        .await?;

    finish_run(&store, &settings, &spill, args.common.advise).await
}

async fn run_gcp(args: GcpArgs, settings: Settings) -> Result<()> {
    let store = PermissionStore::connect(&settings.db_path).await?;
    let client = kube::Client::try_default().await?;
    let progress = Progress::new();

    collect_cluster(
        &client,
        &store,
        &progress,
        ClusterFlavor::Gke,
        args.common.collect_workloads,
        None,
    )
    .await?;

    let ctx = Arc::new(IngestionContext::new(
        settings.clone(),
        progress.clone(),
        Arc::new(CredentialStore::new(None)),
    ));
    let token = auth::gcp_access_token(args.credentials_file.as_deref()).await?;
    let target = GcpTarget {
        project_id: args.project_id.clone(),
        cluster_name: args.cluster_name.clone(),
        region: args.region.clone(),
    };
    let spill = ingest::gcp::extract_logs(Arc::clone(&ctx), target, &token).await?;

    let mut correlator = Correlator::new(&store, &progress);
    correlator
        .process_spill(spill.path(), providers::parse_gcp_line, None)
        .await?;

    finish_run(&store, &settings, &spill, args.common.advise).await
}

async fn run_local(args: LocalArgs, settings: Settings) -> Result<()> {
    let store = PermissionStore::connect(&settings.db_path).await?;
    let client = kube::Client::try_default().await?;
    let progress = Progress::new();

    collect_cluster(
        &client,
        &store,
        &progress,
        ClusterFlavor::Local,
        args.common.collect_workloads,
        None,
    )
    .await?;

    let ctx = Arc::new(IngestionContext::new(
        settings.clone(),
        progress.clone(),
        Arc::new(CredentialStore::new(None)),
    ));
    let spill = ingest::local::extract_logs(Arc::clone(&ctx), &args.log_file).await?;

    let mut correlator = Correlator::new(&store, &progress);
    correlator
        .process_spill(spill.path(), providers::parse_local_line, None)
        .await?;

    finish_run(&store, &settings, &spill, args.common.advise).await
}
