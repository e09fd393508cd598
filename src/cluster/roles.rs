/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cluster/roles.rs
 *
 * Role and ClusterRole lookup maps. Bindings reference these by name only,
 * so resolution is a single map lookup: Roles are keyed `namespace/name`,
 * ClusterRoles by bare name.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use anyhow::Context;
use k8s_openapi::api::rbac::v1 as rbac;
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::HashMap;
use tracing::info;

use crate::error::Result;

pub type RoleMap = HashMap<String, rbac::Role>;
pub type ClusterRoleMap = HashMap<String, rbac::ClusterRole>;

/// Lists every Role in the cluster into a map keyed `namespace/name`.
pub async fn collect_roles(client: &Client) -> Result<RoleMap> {
    let api: Api<rbac::Role> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .context("failed to list Roles")?;

    let mut roles = HashMap::new();
    for role in list.items {
        let (Some(namespace), Some(name)) =
            (role.metadata.namespace.clone(), role.metadata.name.clone())
        else {
            continue;
        };
        roles.insert(format!("{}/{}", namespace, name), role);
    }
    info!(count = roles.len(), "collected Roles");
    Ok(roles)
}

/// Lists every ClusterRole into a map keyed by name.
pub async fn collect_cluster_roles(client: &Client) -> Result<ClusterRoleMap> {
    let api: Api<rbac::ClusterRole> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .context("failed to list ClusterRoles")?;

    let mut cluster_roles = HashMap::new();
    for cluster_role in list.items {
        let Some(name) = cluster_role.metadata.name.clone() else {
            continue;
        };
        cluster_roles.insert(name, cluster_role);
    }
    info!(count = cluster_roles.len(), "collected ClusterRoles");
    Ok(cluster_roles)
}
