/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cluster/discovery.rs
 *
 * The discovery cache. Two passes over the cluster's discovery endpoint:
 * the preferred-version pass is authoritative for top-level resource types
 * and their `namespaced` flag; the full group/version sweep collects
 * subresources (resource names containing '/'). Computed once per run and
 * passed by reference; the flattener never talks to the cluster.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use anyhow::Context;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::info;

use crate::error::Result;

/// One top-level resource type as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// `v1` for the core group, `group/version` otherwise.
    pub api_group: String,
    /// Plural resource name, e.g. `pods`.
    pub resource: String,
    pub namespaced: bool,
}

/// Discovery metadata for one run.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryCache {
    /// Preferred-version top-level resources, in discovery order.
    pub resources: Vec<ResourceDescriptor>,
    /// `parent/subresource` -> owning group/version string.
    pub subresources: BTreeMap<String, String>,
    /// All namespace names in the cluster.
    pub namespaces: Vec<String>,
}

impl DiscoveryCache {
    /// Builds the cache from the cluster. Discovery failure is fatal: the
    /// permission table cannot be computed without it.
    pub async fn build(client: &Client) -> Result<Self> {
        let resources = preferred_resources(client).await?;
        let subresources = subresource_map(client).await?;
        let namespaces = list_namespaces(client).await?;
        info!(
            resources = resources.len(),
            subresources = subresources.len(),
            namespaces = namespaces.len(),
            "discovery cache built"
        );
        Ok(Self {
            resources,
            subresources,
            namespaces,
        })
    }

    /// Subresources of `parent` in `api_group`, excluding the parent itself.
    pub fn subresources_of<'a>(&'a self, parent: &'a str, api_group: &'a str) -> impl Iterator<Item = &'a str> {
        self.subresources.iter().filter_map(move |(name, group)| {
            let is_child = name
                .split_once('/')
                .is_some_and(|(p, _)| p == parent);
            (is_child && group == api_group).then_some(name.as_str())
        })
    }
}

fn group_version_label(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

/// The preferred-resources pass: core `v1` plus each group's preferred
/// version, keeping only top-level resource names.
async fn preferred_resources(client: &Client) -> Result<Vec<ResourceDescriptor>> {
    let mut out = Vec::new();

    let core = client
        .list_core_api_resources("v1")
        .await
        .context("failed to list core API resources")?;
    for resource in &core.resources {
        if resource.name.contains('/') {
            continue;
        }
        out.push(ResourceDescriptor {
            api_group: "v1".to_string(),
            resource: resource.name.clone(),
            namespaced: resource.namespaced,
        });
    }

    let groups = client
        .list_api_groups()
        .await
        .context("failed to list API groups")?;
    for group in &groups.groups {
        let Some(preferred) = group
            .preferred_version
            .as_ref()
            .or_else(|| group.versions.first())
        else {
            continue;
        };
        let listing = client
            .list_api_group_resources(&preferred.group_version)
            .await
            .with_context(|| format!("failed to list resources of {}", preferred.group_version))?;
        for resource in &listing.resources {
            if resource.name.contains('/') {
                continue;
            }
            out.push(ResourceDescriptor {
                api_group: group_version_label(&group.name, &preferred.version),
                resource: resource.name.clone(),
                namespaced: resource.namespaced,
            });
        }
    }

    Ok(out)
}

/// The full sweep: every group/version, collecting names containing '/'.
async fn subresource_map(client: &Client) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();

    let core_versions = client
        .list_core_api_versions()
        .await
        .context("failed to list core API versions")?;
    for version in &core_versions.versions {
        let listing = client.list_core_api_resources(version).await?;
        for resource in &listing.resources {
            if resource.name.contains('/') {
                out.insert(resource.name.clone(), "v1".to_string());
            }
        }
    }

    let groups = client.list_api_groups().await?;
    for group in &groups.groups {
        for version in &group.versions {
            let listing = client
                .list_api_group_resources(&version.group_version)
                .await?;
            for resource in &listing.resources {
                if resource.name.contains('/') {
                    out.insert(
                        resource.name.clone(),
                        group_version_label(&group.name, &version.version),
                    );
                }
            }
        }
    }

    Ok(out)
}

async fn list_namespaces(client: &Client) -> Result<Vec<String>> {
    let api: Api<Namespace> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .context("failed to list namespaces")?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|ns| ns.metadata.name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_subresources() -> DiscoveryCache {
        let mut subresources = BTreeMap::new();
        subresources.insert("pods/exec".to_string(), "v1".to_string());
        subresources.insert("pods/log".to_string(), "v1".to_string());
        subresources.insert("podsecuritypolicies/review".to_string(), "policy/v1".to_string());
        subresources.insert("deployments/scale".to_string(), "apps/v1".to_string());
        DiscoveryCache {
            resources: Vec::new(),
            subresources,
            namespaces: vec!["default".into()],
        }
    }

    #[test]
    fn subresource_lookup_matches_parent_and_group() {
        let cache = cache_with_subresources();
        let pods: Vec<_> = cache.subresources_of("pods", "v1").collect();
        assert_eq!(pods, vec!["pods/exec", "pods/log"]);

        // A parent sharing a prefix must not pick up the other resource's
        // subresources, and group mismatches are excluded.
        assert_eq!(cache.subresources_of("pod", "v1").count(), 0);
        assert_eq!(cache.subresources_of("pods", "apps/v1").count(), 0);
        let scale: Vec<_> = cache.subresources_of("deployments", "apps/v1").collect();
        assert_eq!(scale, vec!["deployments/scale"]);
    }

    #[test]
    fn group_version_labels() {
        assert_eq!(group_version_label("", "v1"), "v1");
        assert_eq!(group_version_label("apps", "v1"), "apps/v1");
    }
}
