/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cli.rs
 *
 * The command-line surface: one subcommand per log provider, each with its
 * provider-specific flags plus the two universal flags
 * (--collect-workloads, --advise). Declarative clap definitions keep the
 * help text in sync with the documentation comments.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use clap::{Args, Parser, Subcommand};

/// Kubernetes RBAC least-privilege auditor: flattens every effective
/// permission in a cluster and correlates it with audit-log usage.
#[derive(Parser, Debug)]
#[command(name = "kiempossible", version, about, long_about = None)]
pub struct Cli {
    /// The provider to audit.
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Audit an EKS cluster using CloudWatch audit logs.
    Aws(AwsArgs),

    /// Audit an AKS cluster using Log Analytics audit logs.
    Azure(AzureArgs),

    /// Audit a GKE cluster using Cloud Logging audit logs.
    Gcp(GcpArgs),

    /// Audit any cluster using a local kube-apiserver audit log file.
    Local(LocalArgs),
}

#[derive(Args, Debug)]
pub struct AwsArgs {
    /// EKS cluster name.
    #[arg(long, required = true)]
    pub cluster_name: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct AzureArgs {
    /// AKS cluster name.
    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Azure AD tenant of the service principal.
    #[arg(long, required = true)]
    pub tenant_id: String,

    /// Subscription holding the cluster.
    #[arg(long)]
    pub subscription: Option<String>,

    /// Resource group holding the cluster.
    #[arg(long)]
    pub resource_group: Option<String>,

    /// Service principal client id.
    #[arg(long, required = true)]
    pub client_id: String,

    /// Service principal client secret.
    #[arg(long, required = true)]
    pub client_secret: String,

    /// Log Analytics workspace the AKSAudit table lives in.
    #[arg(long, required = true)]
    pub workspace_id: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct GcpArgs {
    /// Path to a service-account JSON key file. When omitted, the gcloud
    /// application-default credentials are used.
    #[arg(long)]
    pub credentials_file: Option<String>,

    /// GKE cluster name.
    #[arg(long, required = true)]
    pub cluster_name: String,

    /// Project the cluster belongs to.
    #[arg(long, required = true)]
    pub project_id: String,

    /// Cluster location (region or zone).
    #[arg(long, required = true)]
    pub region: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct LocalArgs {
    /// Path to the kube-apiserver audit log file.
    #[arg(long, required = true)]
    pub log_file: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Also record which workloads run as which service accounts.
    #[arg(long)]
    pub collect_workloads: bool,

    /// Write the risky/unused permission report after collection.
    #[arg(long)]
    pub advise: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn aws_requires_a_cluster_name() {
        assert!(Cli::try_parse_from(["kiempossible", "aws"]).is_err());
        let cli = Cli::try_parse_from([
            "kiempossible",
            "aws",
            "--cluster-name",
            "payments",
            "--advise",
        ])
        .unwrap();
        match cli.command {
            Command::Aws(args) => {
                assert_eq!(args.cluster_name, "payments");
                assert!(args.common.advise);
                assert!(!args.common.collect_workloads);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn azure_requires_service_principal_and_workspace() {
        assert!(Cli::try_parse_from([
            "kiempossible",
            "azure",
            "--tenant-id",
            "t",
            "--client-id",
            "c",
        ])
        .is_err());

        let cli = Cli::try_parse_from([
            "kiempossible",
            "azure",
            "--tenant-id",
            "t",
            "--client-id",
            "c",
            "--client-secret",
            "s",
            "--workspace-id",
            "w",
            "--collect-workloads",
        ])
        .unwrap();
        match cli.command {
            Command::Azure(args) => {
                assert_eq!(args.workspace_id, "w");
                assert!(args.common.collect_workloads);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn local_requires_a_log_file() {
        assert!(Cli::try_parse_from(["kiempossible", "local"]).is_err());
        assert!(Cli::try_parse_from(["kiempossible", "local", "--log-file", "audit.log"]).is_ok());
    }
}
