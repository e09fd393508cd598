/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/policies.rs
 *
 * The EKS access-policy expander. Cloud-managed access entries grant
 * permissions outside RBAC objects; they surface in audit events whose
 * authorization reason names an access entry ARN. For each such principal
 * (at most once per run) the associated access policies are listed from the
 * EKS control plane and materialized into concrete permission rows:
 *
 * - AmazonEKSClusterAdminPolicy: every distinct (apiGroup, resource, verb)
 *   currently in the table, fanned across namespaces for namespaced
 *   resources, cluster-wide otherwise.
 * - AmazonEKSAdminViewPolicy: the same restricted to get/list/watch.
 * - AmazonEKSAdminPolicy / AmazonEKSEditPolicy / AmazonEKSViewPolicy:
 *   hard-coded permission tables in `apiGroup:resource:verbs` form.
 *
 * Duplicate rows die silently at the unique index.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{sigv4, CredentialStore};
use crate::error::{Error, Result};
use crate::ingest::{aws::classify_aws_error, backoff_delay, progress::Progress};
use crate::normalize::AuditEvent;
use crate::store::{PermissionRow, PermissionStore};

const MAX_ATTEMPTS: u32 = 5;

/// Static policy tables, encoded as `apiGroup:resource:verb,verb,...`.
/// All static-policy resources are namespaced.
pub const EKS_VIEW_POLICY_PERMISSIONS: &[&str] = &[
    "v1:pods:get,list,watch",
    "v1:pods/log:get,list,watch",
    "v1:pods/status:get,list,watch",
    "v1:configmaps:get,list,watch",
    "v1:endpoints:get,list,watch",
    "v1:persistentvolumeclaims:get,list,watch",
    "v1:persistentvolumeclaims/status:get,list,watch",
    "v1:services:get,list,watch",
    "v1:services/status:get,list,watch",
    "v1:serviceaccounts:get,list,watch",
    "v1:replicationcontrollers:get,list,watch",
    "v1:replicationcontrollers/scale:get,list,watch",
    "v1:limitranges:get,list,watch",
    "v1:resourcequotas:get,list,watch",
    "v1:resourcequotas/status:get,list,watch",
    "v1:bindings:get,list,watch",
    "v1:events:get,list,watch",
    "apps/v1:deployments:get,list,watch",
    "apps/v1:deployments/scale:get,list,watch",
    "apps/v1:daemonsets:get,list,watch",
    "apps/v1:replicasets:get,list,watch",
    "apps/v1:replicasets/scale:get,list,watch",
    "apps/v1:statefulsets:get,list,watch",
    "apps/v1:statefulsets/scale:get,list,watch",
    "batch/v1:jobs:get,list,watch",
    "batch/v1:cronjobs:get,list,watch",
    "autoscaling/v2:horizontalpodautoscalers:get,list,watch",
    "networking.k8s.io/v1:ingresses:get,list,watch",
    "networking.k8s.io/v1:networkpolicies:get,list,watch",
    "policy/v1:poddisruptionbudgets:get,list,watch",
];

pub const EKS_EDIT_POLICY_PERMISSIONS: &[&str] = &[
    "v1:pods:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:pods/attach:create,get",
    "v1:pods/exec:create,get",
    "v1:pods/portforward:create,get",
    "v1:pods/proxy:create,delete,get,patch,update",
    "v1:configmaps:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:endpoints:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:persistentvolumeclaims:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:secrets:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:services:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:services/proxy:create,delete,get,patch,update",
    "v1:serviceaccounts:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:replicationcontrollers:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:replicationcontrollers/scale:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:limitranges:get,list,watch",
    "v1:resourcequotas:get,list,watch",
    "v1:events:get,list,watch",
    "apps/v1:deployments:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:deployments/rollback:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:deployments/scale:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:daemonsets:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:replicasets:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:replicasets/scale:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:statefulsets:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:statefulsets/scale:create,delete,deletecollection,get,list,patch,update,watch",
    "batch/v1:jobs:create,delete,deletecollection,get,list,patch,update,watch",
    "batch/v1:cronjobs:create,delete,deletecollection,get,list,patch,update,watch",
    "autoscaling/v2:horizontalpodautoscalers:create,delete,deletecollection,get,list,patch,update,watch",
    "networking.k8s.io/v1:ingresses:create,delete,deletecollection,get,list,patch,update,watch",
    "networking.k8s.io/v1:networkpolicies:create,delete,deletecollection,get,list,patch,update,watch",
    "policy/v1:poddisruptionbudgets:create,delete,deletecollection,get,list,patch,update,watch",
];

pub const EKS_ADMIN_POLICY_PERMISSIONS: &[&str] = &[
    // Everything the edit policy grants, plus namespace-level RBAC control.
    "v1:pods:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:pods/attach:create,get",
    "v1:pods/exec:create,get",
    "v1:pods/portforward:create,get",
    "v1:pods/proxy:create,delete,get,patch,update",
    "v1:configmaps:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:endpoints:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:persistentvolumeclaims:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:secrets:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:services:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:services/proxy:create,delete,get,patch,update",
    "v1:serviceaccounts:create,delete,deletecollection,get,list,patch,update,watch,impersonate",
    "v1:serviceaccounts/token:create",
    "v1:replicationcontrollers:create,delete,deletecollection,get,list,patch,update,watch",
    "v1:resourcequotas:get,list,watch",
    "v1:events:get,list,watch",
    "apps/v1:deployments:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:daemonsets:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:replicasets:create,delete,deletecollection,get,list,patch,update,watch",
    "apps/v1:statefulsets:create,delete,deletecollection,get,list,patch,update,watch",
    "batch/v1:jobs:create,delete,deletecollection,get,list,patch,update,watch",
    "batch/v1:cronjobs:create,delete,deletecollection,get,list,patch,update,watch",
    "autoscaling/v2:horizontalpodautoscalers:create,delete,deletecollection,get,list,patch,update,watch",
    "networking.k8s.io/v1:ingresses:create,delete,deletecollection,get,list,patch,update,watch",
    "networking.k8s.io/v1:networkpolicies:create,delete,deletecollection,get,list,patch,update,watch",
    "policy/v1:poddisruptionbudgets:create,delete,deletecollection,get,list,patch,update,watch",
    "rbac.authorization.k8s.io/v1:roles:create,delete,deletecollection,get,list,patch,update,watch,bind,escalate",
    "rbac.authorization.k8s.io/v1:rolebindings:create,delete,deletecollection,get,list,patch,update,watch",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessScope {
    Cluster,
    Namespaces(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAccessPoliciesResponse {
    #[serde(default)]
    associated_access_policies: Vec<AssociatedPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssociatedPolicy {
    policy_arn: String,
    access_scope: ApiAccessScope,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAccessScope {
    r#type: String,
    #[serde(default)]
    namespaces: Vec<String>,
}

pub struct AccessPolicyExpander {
    store: PermissionStore,
    credentials: Arc<CredentialStore>,
    http: reqwest::Client,
    progress: Progress,
    cluster_name: String,
    namespaces: Vec<String>,
    namespace_set: HashSet<String>,
    /// Entities already expanded this run.
    processed: HashSet<String>,
}

impl AccessPolicyExpander {
    pub fn new(
        store: PermissionStore,
        credentials: Arc<CredentialStore>,
        progress: Progress,
        cluster_name: String,
        namespaces: Vec<String>,
    ) -> Self {
        let namespace_set = namespaces.iter().cloned().collect();
        Self {
            store,
            credentials,
            http: reqwest::Client::new(),
            progress,
            cluster_name,
            namespaces,
            namespace_set,
            processed: HashSet::new(),
        }
    }

    /// Expands the access policies behind one audit event, once per entity.
    pub async fn handle_event(&mut self, event: &AuditEvent) -> Result<()> {
        if self.processed.contains(&event.username) {
            return Ok(());
        }
        let Some(access_entry_arn) = parse_access_entry_arn(&event.authorization_reason) else {
            return Ok(());
        };

        let policies = self.list_associated_access_policies(&access_entry_arn).await?;
        self.expand_policies(&event.username, &access_entry_arn, &policies)
            .await?;
        self.processed.insert(event.username.clone());
        Ok(())
    }

    /// Materializes each policy for the entity.
    pub async fn expand_policies(
        &self,
        entity_name: &str,
        access_entry_arn: &str,
        policies: &[(String, AccessScope)],
    ) -> Result<()> {
        for (policy_name, scope) in policies {
            match policy_name.as_str() {
                "AmazonEKSClusterAdminPolicy" => {
                    self.expand_from_table(entity_name, access_entry_arn, policy_name, scope, false)
                        .await?
                }
                "AmazonEKSAdminViewPolicy" => {
                    self.expand_from_table(entity_name, access_entry_arn, policy_name, scope, true)
                        .await?
                }
                "AmazonEKSAdminPolicy" => {
                    self.expand_static(
                        entity_name,
                        access_entry_arn,
                        policy_name,
                        scope,
                        EKS_ADMIN_POLICY_PERMISSIONS,
                    )
                    .await?
                }
                "AmazonEKSEditPolicy" => {
                    self.expand_static(
                        entity_name,
                        access_entry_arn,
                        policy_name,
                        scope,
                        EKS_EDIT_POLICY_PERMISSIONS,
                    )
                    .await?
                }
                "AmazonEKSViewPolicy" => {
                    self.expand_static(
                        entity_name,
                        access_entry_arn,
                        policy_name,
                        scope,
                        EKS_VIEW_POLICY_PERMISSIONS,
                    )
                    .await?
                }
                other => warn!(policy = other, "unrecognized EKS access policy, skipping"),
            }
        }
        info!(entity = entity_name, "expanded EKS access policies");
        Ok(())
    }

    /// ClusterAdmin / AdminView expansion: replays the distinct tuples
    /// already present in the table under the policy's identity.
    async fn expand_from_table(
        &self,
        entity_name: &str,
        access_entry_arn: &str,
        policy_name: &str,
        scope: &AccessScope,
        view_only: bool,
    ) -> Result<()> {
        match scope {
            AccessScope::Cluster => {
                for (api_group, resource_type, verb) in
                    self.store.distinct_permission_tuples(view_only).await?
                {
                    let namespaced = self
                        .store
                        .is_resource_namespaced(&resource_type, &self.namespace_set)
                        .await?;
                    if namespaced {
                        for namespace in &self.namespaces {
                            self.insert_with_subresources(
                                entity_name,
                                access_entry_arn,
                                policy_name,
                                &api_group,
                                &resource_type,
                                &verb,
                                namespace,
                            )
                            .await?;
                        }
                    } else {
                        self.insert_with_subresources(
                            entity_name,
                            access_entry_arn,
                            policy_name,
                            &api_group,
                            &resource_type,
                            &verb,
                            "cluster-wide",
                        )
                        .await?;
                    }
                }
            }
            AccessScope::Namespaces(targets) => {
                for namespace in targets {
                    for (api_group, resource_type, verb, permission_scope) in self
                        .store
                        .namespace_permission_tuples(namespace, view_only)
                        .await?
                    {
                        self.insert_with_subresources(
                            entity_name,
                            access_entry_arn,
                            policy_name,
                            &api_group,
                            &resource_type,
                            &verb,
                            &permission_scope,
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Static-table expansion. The static policies only carry namespaced
    /// resources, so a cluster scope fans out across every namespace.
    async fn expand_static(
        &self,
        entity_name: &str,
        access_entry_arn: &str,
        policy_name: &str,
        scope: &AccessScope,
        table: &[&str],
    ) -> Result<()> {
        let targets: Vec<&str> = match scope {
            AccessScope::Cluster => self.namespaces.iter().map(String::as_str).collect(),
            AccessScope::Namespaces(list) => list.iter().map(String::as_str).collect(),
        };

        for entry in table {
            let Some((api_group, resource_type, verbs)) = parse_static_entry(entry) else {
                warn!(entry, "invalid static policy entry");
                continue;
            };
            let is_subresource = resource_type.contains('/');
            for namespace in &targets {
                for verb in &verbs {
                    self.insert_row(
                        entity_name,
                        access_entry_arn,
                        policy_name,
                        api_group,
                        resource_type,
                        verb,
                        namespace,
                    )
                    .await?;
                    if !is_subresource {
                        for subresource in
                            self.store.subresources_of(resource_type, api_group).await?
                        {
                            self.insert_row(
                                entity_name,
                                access_entry_arn,
                                policy_name,
                                api_group,
                                &subresource,
                                verb,
                                namespace,
                            )
                            .await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn insert_with_subresources(
        &self,
        entity_name: &str,
        access_entry_arn: &str,
        policy_name: &str,
        api_group: &str,
        resource_type: &str,
        verb: &str,
        scope: &str,
    ) -> Result<()> {
        self.insert_row(
            entity_name,
            access_entry_arn,
            policy_name,
            api_group,
            resource_type,
            verb,
            scope,
        )
        .await?;
        for subresource in self.store.subresources_of(resource_type, api_group).await? {
            self.insert_row(
                entity_name,
                access_entry_arn,
                policy_name,
                api_group,
                &subresource,
                verb,
                scope,
            )
            .await?;
        }
        Ok(())
    }

    async fn insert_row(
        &self,
        entity_name: &str,
        access_entry_arn: &str,
        policy_name: &str,
        api_group: &str,
        resource_type: &str,
        verb: &str,
        scope: &str,
    ) -> Result<()> {
        self.store
            .insert_permission(&PermissionRow {
                entity_name: entity_name.to_string(),
                entity_type: "User".to_string(),
                api_group: api_group.to_string(),
                resource_type: resource_type.to_string(),
                verb: verb.to_string(),
                permission_scope: scope.to_string(),
                permission_source: policy_name.to_string(),
                permission_source_type: "EKS Access Policy".to_string(),
                permission_binding: access_entry_arn.to_string(),
                permission_binding_type: "EKS Access Entry".to_string(),
                last_used_time: None,
                last_used_resource: None,
            })
            .await
    }

    /// Lists the policies associated with the principal's access entry,
    /// with the same throttle/reauth protocol as the log fetcher.
    async fn list_associated_access_policies(
        &self,
        principal_arn: &str,
    ) -> Result<Vec<(String, AccessScope)>> {
        let mut attempt: u32 = 0;
        while attempt < MAX_ATTEMPTS {
            match self.fetch_access_policies(principal_arn).await {
                Ok(policies) => return Ok(policies),
                Err(Error::Throttled(message)) => {
                    let delay = backoff_delay(attempt);
                    warn!(%message, ?delay, "throttling detected, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(Error::ExpiredCredentials(message)) => {
                    warn!(%message, "AWS credentials expired");
                    if self.credentials.invalidate() {
                        self.credentials
                            .reauthenticate_interactive(&self.progress)
                            .await?;
                    } else {
                        self.credentials.current().await;
                    }
                    attempt = 0;
                }
                Err(other) => return Err(other),
            }
        }
        Err(Error::RetriesExhausted)
    }

    async fn fetch_access_policies(
        &self,
        principal_arn: &str,
    ) -> Result<Vec<(String, AccessScope)>> {
        let credentials = self.credentials.current().await;
        let url: reqwest::Url = format!(
            "https://eks.{}.amazonaws.com/clusters/{}/access-entries/{}/access-policies",
            credentials.region,
            self.cluster_name,
            sigv4::uri_encode(principal_arn),
        )
        .parse()
        .map_err(|e| Error::Provider(format!("invalid EKS endpoint: {e}")))?;

        let mut headers = reqwest::header::HeaderMap::new();
        sigv4::sign_request(&credentials, "eks", "GET", &url, &mut headers, b"", Utc::now());

        let response = self.http.get(url).headers(headers).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify_aws_error(&text));
        }

        let parsed: ListAccessPoliciesResponse = serde_json::from_str(&text)?;
        Ok(parsed
            .associated_access_policies
            .into_iter()
            .map(|policy| {
                let name = policy_name_from_arn(&policy.policy_arn);
                let scope = if policy.access_scope.r#type == "cluster" {
                    AccessScope::Cluster
                } else {
                    AccessScope::Namespaces(policy.access_scope.namespaces)
                };
                (name, scope)
            })
            .collect())
    }
}

/// Extracts the access entry ARN from an authorization reason of the form
/// `... allowed by ClusterRoleBinding "<arn>+<policy>" of ClusterRole ...`
/// (or the RoleBinding/Role variant).
pub fn parse_access_entry_arn(reason: &str) -> Option<String> {
    for (binding_marker, role_marker) in [
        ("allowed by ClusterRoleBinding ", " of ClusterRole "),
        ("allowed by RoleBinding ", " of Role "),
    ] {
        let Some((_, rest)) = reason.split_once(binding_marker) else {
            continue;
        };
        let Some((binding, _)) = rest.split_once(role_marker) else {
            continue;
        };
        let Some((entry_arn, _)) = binding.split_once('+') else {
            continue;
        };
        return Some(entry_arn.trim_matches('"').to_string());
    }
    None
}

fn policy_name_from_arn(policy_arn: &str) -> String {
    policy_arn
        .rsplit('/')
        .next()
        .unwrap_or(policy_arn)
        .to_string()
}

fn parse_static_entry(entry: &str) -> Option<(&str, &str, Vec<&str>)> {
    let mut parts = entry.splitn(3, ':');
    let api_group = parts.next()?;
    let resource_type = parts.next()?;
    let verbs: Vec<&str> = parts.next()?.split(',').collect();
    if api_group.is_empty() || resource_type.is_empty() || verbs.is_empty() {
        return None;
    }
    Some((api_group, resource_type, verbs))
}
