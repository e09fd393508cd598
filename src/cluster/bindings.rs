/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cluster/bindings.rs
 *
 * The binding walker. Traverses RoleBindings per namespace and
 * ClusterRoleBindings for the cluster, resolves the referenced Role or
 * ClusterRole, expands every rule through the flattener, and inserts one
 * permission row per (subject, verb, concrete resource, scope).
 *
 * Scope rules:
 * - `resourceNames` restrictions scope each row to `namespace/name`
 *   (RoleBinding) or the bare name (ClusterRoleBinding).
 * - A RoleBinding otherwise scopes to its namespace, except over a
 *   cluster-scoped resource, where `cluster-wide` is emitted.
 * - A ClusterRoleBinding over a namespaced resource fans out to one row per
 *   cluster namespace; over a cluster-scoped resource it emits one
 *   `cluster-wide` row.
 * In every branch, discovery-known subresources of the expanded resource are
 * emitted alongside it (never implied by the parent in the store).
 *
 * SPDX-License-Identifier: Apache-2.0 */

use k8s_openapi::api::rbac::v1 as rbac;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info, warn};

use super::discovery::DiscoveryCache;
use super::flatten::{flatten, ExpandedPermission};
use super::roles::{ClusterRoleMap, RoleMap};
use crate::error::Result;
use crate::ingest::progress::Progress;
use crate::store::{PermissionRow, PermissionStore};

/// Immutable row fields shared by everything a single (binding, subject,
/// role) combination emits.
struct EmitTarget<'a> {
    entity_name: &'a str,
    entity_type: &'a str,
    source: &'a str,
    source_type: &'a str,
    binding: &'a str,
    binding_type: &'a str,
}

enum BindingKind<'a> {
    /// Carries the binding's namespace.
    RoleBinding(&'a str),
    ClusterRoleBinding,
}

/// Walks all RoleBindings, namespace by namespace.
pub async fn collect_role_bindings(
    client: &Client,
    store: &PermissionStore,
    cache: &DiscoveryCache,
    roles: &RoleMap,
    cluster_roles: &ClusterRoleMap,
    progress: &Progress,
) -> Result<()> {
    progress.start("roles and roleBindings processed");

    for namespace in &cache.namespaces {
        let api: Api<rbac::RoleBinding> = Api::namespaced(client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;

        for rb in list.items {
            let binding_name = rb.metadata.name.clone().unwrap_or_default();
            for subject in rb.subjects.as_deref().unwrap_or_default() {
                let entity_name = if subject.kind == "ServiceAccount" {
                    format!("{}:{}", namespace, subject.name)
                } else {
                    subject.name.clone()
                };

                match rb.role_ref.kind.as_str() {
                    "Role" => {
                        let key = format!("{}/{}", namespace, rb.role_ref.name);
                        let Some(role) = roles.get(&key) else {
                            warn!(role = %key, binding = %binding_name, "Role not found, skipping");
                            continue;
                        };
                        let target = EmitTarget {
                            entity_name: &entity_name,
                            entity_type: &subject.kind,
                            source: &rb.role_ref.name,
                            source_type: "Role",
                            binding: &binding_name,
                            binding_type: "RoleBinding",
                        };
                        process_rules(
                            store,
                            cache,
                            role.rules.as_deref().unwrap_or_default(),
                            &target,
                            &BindingKind::RoleBinding(namespace),
                        )
                        .await?;
                    }
                    "ClusterRole" => {
                        let Some(cluster_role) = cluster_roles.get(&rb.role_ref.name) else {
                            warn!(
                                cluster_role = %rb.role_ref.name,
                                binding = %binding_name,
                                "ClusterRole not found, skipping"
                            );
                            continue;
                        };
                        let target = EmitTarget {
                            entity_name: &entity_name,
                            entity_type: &subject.kind,
                            source: &rb.role_ref.name,
                            source_type: "ClusterRole",
                            binding: &binding_name,
                            binding_type: "RoleBinding",
                        };
                        process_rules(
                            store,
                            cache,
                            cluster_role.rules.as_deref().unwrap_or_default(),
                            &target,
                            &BindingKind::RoleBinding(namespace),
                        )
                        .await?;
                    }
                    other => {
                        warn!(kind = other, binding = %binding_name, "unsupported RoleRef kind");
                    }
                }
            }
            progress.add(1);
        }
    }

    progress.stop();
    info!("inserted RoleBinding permissions");
    Ok(())
}

/// Walks all ClusterRoleBindings.
pub async fn collect_cluster_role_bindings(
    client: &Client,
    store: &PermissionStore,
    cache: &DiscoveryCache,
    cluster_roles: &ClusterRoleMap,
    progress: &Progress,
) -> Result<()> {
    let api: Api<rbac::ClusterRoleBinding> = Api::all(client.clone());
    let list = api.list(&ListParams::default()).await?;

    progress.start("clusterRoles and clusterRoleBindings processed");

    for crb in list.items {
        let binding_name = crb.metadata.name.clone().unwrap_or_default();
        for subject in crb.subjects.as_deref().unwrap_or_default() {
            let Some(cluster_role) = cluster_roles.get(&crb.role_ref.name) else {
                warn!(
                    cluster_role = %crb.role_ref.name,
                    binding = %binding_name,
                    "ClusterRole not found, skipping"
                );
                continue;
            };

            let entity_name = if subject.kind == "ServiceAccount" {
                format!(
                    "{}:{}",
                    subject.namespace.as_deref().unwrap_or_default(),
                    subject.name
                )
            } else {
                subject.name.clone()
            };

            let target = EmitTarget {
                entity_name: &entity_name,
                entity_type: &subject.kind,
                source: &crb.role_ref.name,
                source_type: "ClusterRole",
                binding: &binding_name,
                binding_type: "ClusterRoleBinding",
            };
            process_rules(
                store,
                cache,
                cluster_role.rules.as_deref().unwrap_or_default(),
                &target,
                &BindingKind::ClusterRoleBinding,
            )
            .await?;
        }
        progress.add(1);
    }

    progress.stop();
    info!("inserted ClusterRoleBinding permissions");
    Ok(())
}

/// Expands every rule of one resolved role and inserts the resulting rows in
/// a single batch.
async fn process_rules(
    store: &PermissionStore,
    cache: &DiscoveryCache,
    rules: &[rbac::PolicyRule],
    target: &EmitTarget<'_>,
    kind: &BindingKind<'_>,
) -> Result<()> {
    let mut rows = Vec::new();

    for rule in rules {
        let resource_names = rule.resource_names.as_deref().unwrap_or_default();
        let api_groups = rule.api_groups.as_deref().unwrap_or_default();
        let resources = rule.resources.as_deref().unwrap_or_default();

        for _api_group in api_groups {
            for resource in resources {
                for verb in &rule.verbs {
                    for expanded in flatten(&cache.resources, verb, resource) {
                        emit_descriptor(
                            &mut rows,
                            cache,
                            target,
                            kind,
                            &expanded,
                            resource_names,
                        );
                    }
                }
            }
        }
    }

    store.insert_permissions(&rows).await
}

/// Emits the rows for one expanded descriptor: the scope branch, plus the
/// subresource siblings whenever the descriptor itself is not already a
/// subresource.
fn emit_descriptor(
    rows: &mut Vec<PermissionRow>,
    cache: &DiscoveryCache,
    target: &EmitTarget<'_>,
    kind: &BindingKind<'_>,
    expanded: &ExpandedPermission,
    resource_names: &[String],
) {
    let scopes: Vec<String> = if !resource_names.is_empty() {
        match kind {
            BindingKind::RoleBinding(namespace) => resource_names
                .iter()
                .map(|name| format!("{}/{}", namespace, name))
                .collect(),
            BindingKind::ClusterRoleBinding => resource_names.to_vec(),
        }
    } else {
        match kind {
            BindingKind::RoleBinding(namespace) => {
                if expanded.namespaced {
                    vec![namespace.to_string()]
                } else {
                    // Valid in RBAC but inert: a RoleBinding cannot grant
                    // access to a cluster-scoped resource. The row is still
                    // recorded so the grant stays visible in the table.
                    debug!(
                        resource = %expanded.resource,
                        binding = %target.binding,
                        "RoleBinding over cluster-scoped resource"
                    );
                    vec!["cluster-wide".to_string()]
                }
            }
            BindingKind::ClusterRoleBinding => {
                if expanded.namespaced {
                    cache.namespaces.clone()
                } else {
                    vec!["cluster-wide".to_string()]
                }
            }
        }
    };

    let is_subresource = expanded.resource.contains('/');
    for scope in &scopes {
        if !is_subresource {
            for subresource in cache.subresources_of(&expanded.resource, &expanded.api_group) {
                rows.push(make_row(target, expanded, subresource, scope));
            }
        }
        rows.push(make_row(target, expanded, &expanded.resource, scope));
    }
}

fn make_row(
    target: &EmitTarget<'_>,
    expanded: &ExpandedPermission,
    resource_type: &str,
    scope: &str,
) -> PermissionRow {
    PermissionRow {
        entity_name: target.entity_name.to_string(),
        entity_type: target.entity_type.to_string(),
        api_group: expanded.api_group.clone(),
        resource_type: resource_type.to_string(),
        verb: expanded.verb.clone(),
        permission_scope: scope.to_string(),
        permission_source: target.source.to_string(),
        permission_source_type: target.source_type.to_string(),
        permission_binding: target.binding.to_string(),
        permission_binding_type: target.binding_type.to_string(),
        last_used_time: None,
        last_used_resource: None,
    }
}
