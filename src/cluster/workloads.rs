/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cluster/workloads.rs
 *
 * Workload identity collection (`--collect-workloads`). Every workload kind
 * that runs pods is scanned per namespace; workloads with a non-empty
 * service account are recorded as `<namespace>:<serviceaccount>` together
 * with their first owner reference (or themselves when unowned).
 *
 * Cloud IAM identity enrichment:
 * - EKS: pod-identity associations resolved through the control plane; a
 *   pod mounting the `eks-pod-identity-token` volume gets the associated
 *   role ARN.
 * - AKS: workloads labeled `azure.workload.identity/use=true` get the
 *   `AZURE_CLIENT_ID` container env value, falling back to the service
 *   account's `azure.workload.identity/client-id` annotation.
 * - GKE: the service account's `iam.gke.io/gcp-service-account` annotation.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Container, Pod, PodTemplateSpec, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams};
use kube::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{sigv4, CredentialStore};
use crate::error::{Error, Result};
use crate::store::{PermissionStore, WorkloadIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterFlavor {
    Eks,
    Aks,
    Gke,
    Local,
}

const AZURE_IDENTITY_LABEL: &str = "azure.workload.identity/use";
const AZURE_CLIENT_ID_ANNOTATION: &str = "azure.workload.identity/client-id";
const GKE_SA_ANNOTATION: &str = "iam.gke.io/gcp-service-account";
const EKS_IDENTITY_VOLUME: &str = "eks-pod-identity-token";

pub struct WorkloadCollector {
    client: Client,
    store: PermissionStore,
    flavor: ClusterFlavor,
    /// `namespace/serviceaccount` -> IAM role ARN (EKS only).
    eks_identity_map: HashMap<String, String>,
}

impl WorkloadCollector {
    pub fn new(client: Client, store: PermissionStore, flavor: ClusterFlavor) -> Self {
        Self {
            client,
            store,
            flavor,
            eks_identity_map: HashMap::new(),
        }
    }

    /// Resolves EKS pod-identity associations before collection. Failures
    /// degrade to an empty map: collection proceeds without role ARNs.
    pub async fn load_eks_pod_identities(
        &mut self,
        credentials: &Arc<CredentialStore>,
        http: &reqwest::Client,
        cluster_name: &str,
    ) {
        match fetch_pod_identity_associations(credentials, http, cluster_name).await {
            Ok(map) => self.eks_identity_map = map,
            Err(e) => warn!(error = %e, "could not list EKS pod identity associations"),
        }
    }

    /// Collects every workload kind across all namespaces.
    pub async fn collect(&self, namespaces: &[String]) -> Result<()> {
        for namespace in namespaces {
            self.collect_pods(namespace).await?;
            self.collect_kind::<Deployment>(namespace, "Deployment", deployment_template)
                .await?;
            self.collect_kind::<DaemonSet>(namespace, "DaemonSet", daemonset_template)
                .await?;
            self.collect_kind::<ReplicaSet>(namespace, "ReplicaSet", replicaset_template)
                .await?;
            self.collect_kind::<StatefulSet>(namespace, "StatefulSet", statefulset_template)
                .await?;
            self.collect_kind::<Job>(namespace, "Job", job_template)
                .await?;
            self.collect_kind::<CronJob>(namespace, "CronJob", cronjob_template)
                .await?;
        }
        info!("workload information collected");
        Ok(())
    }

    async fn collect_pods(&self, namespace: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        for pod in api.list(&ListParams::default()).await?.items {
            let Some(spec) = pod.spec.as_ref() else { continue };
            let sa_name = spec.service_account_name.clone().unwrap_or_default();
            if sa_name.is_empty() {
                continue;
            }

            let mut identity = String::new();
            if self.flavor == ClusterFlavor::Eks {
                let mounts_identity_token = spec
                    .volumes
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|v| v.name == EKS_IDENTITY_VOLUME);
                if mounts_identity_token {
                    let key = format!("{}/{}", namespace, sa_name);
                    identity = self.eks_identity_map.get(&key).cloned().unwrap_or_default();
                }
            } else {
                identity = self
                    .cloud_identity(namespace, &sa_name, pod.metadata.labels.as_ref(), &spec.containers)
                    .await;
            }

            let name = pod.metadata.name.clone().unwrap_or_default();
            let (owner_type, owner_name) = owner_info(&pod.metadata, "pod", &name);
            self.store
                .upsert_workload(&WorkloadIdentity {
                    workload_type: "Pod".to_string(),
                    workload_name: name,
                    service_account_name: format!("{}:{}", namespace, sa_name),
                    workload_identity: identity,
                    original_owner_type: owner_type,
                    original_owner_name: owner_name,
                })
                .await?;
        }
        Ok(())
    }

    /// Shared path for the template-bearing workload kinds.
    async fn collect_kind<K>(
        &self,
        namespace: &str,
        kind: &str,
        template_of: fn(&K) -> Option<&k8s_openapi::api::core::v1::PodTemplateSpec>,
    ) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + k8s_openapi::Metadata<Ty = ObjectMeta>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        for item in api.list(&ListParams::default()).await?.items {
            let Some(template) = template_of(&item) else { continue };
            let Some(pod_spec) = template.spec.as_ref() else { continue };
            let sa_name = pod_spec.service_account_name.clone().unwrap_or_default();
            if sa_name.is_empty() {
                continue;
            }

            let identity = if self.flavor == ClusterFlavor::Eks {
                // Pod-identity token volumes only exist on running pods.
                String::new()
            } else {
                self.cloud_identity(
                    namespace,
                    &sa_name,
                    template.metadata.as_ref().and_then(|m| m.labels.as_ref()),
                    &pod_spec.containers,
                )
                .await
            };

            let metadata = item.metadata();
            let name = metadata.name.clone().unwrap_or_default();
            let (owner_type, owner_name) = owner_info(metadata, &kind.to_lowercase(), &name);
            self.store
                .upsert_workload(&WorkloadIdentity {
                    workload_type: kind.to_string(),
                    workload_name: name,
                    service_account_name: format!("{}:{}", namespace, sa_name),
                    workload_identity: identity,
                    original_owner_type: owner_type,
                    original_owner_name: owner_name,
                })
                .await?;
        }
        Ok(())
    }

    /// AKS / GKE identity resolution for one workload.
    async fn cloud_identity(
        &self,
        namespace: &str,
        sa_name: &str,
        labels: Option<&BTreeMap<String, String>>,
        containers: &[Container],
    ) -> String {
        match self.flavor {
            ClusterFlavor::Aks => {
                let opted_in = labels
                    .and_then(|l| l.get(AZURE_IDENTITY_LABEL))
                    .is_some_and(|v| v == "true");
                if !opted_in {
                    return String::new();
                }
                if let Some(client_id) = env_client_id(containers) {
                    return client_id;
                }
                self.sa_annotation(namespace, sa_name, AZURE_CLIENT_ID_ANNOTATION)
                    .await
            }
            ClusterFlavor::Gke => self.sa_annotation(namespace, sa_name, GKE_SA_ANNOTATION).await,
            ClusterFlavor::Eks | ClusterFlavor::Local => String::new(),
        }
    }

    async fn sa_annotation(&self, namespace: &str, sa_name: &str, annotation: &str) -> String {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        match api.get(sa_name).await {
            Ok(sa) => sa
                .metadata
                .annotations
                .and_then(|a| a.get(annotation).cloned())
                .unwrap_or_default(),
            Err(_) => String::new(),
        }
    }
}

fn env_client_id(containers: &[Container]) -> Option<String> {
    for container in containers {
        for env in container.env.as_deref().unwrap_or_default() {
            if env.name == "AZURE_CLIENT_ID" {
                if let Some(value) = env.value.as_ref().filter(|v| !v.is_empty()) {
                    return Some(value.clone());
                }
            }
        }
    }
    None
}

fn deployment_template(d: &Deployment) -> Option<&PodTemplateSpec> {
    d.spec.as_ref().map(|s| &s.template)
}

fn daemonset_template(d: &DaemonSet) -> Option<&PodTemplateSpec> {
    d.spec.as_ref().map(|s| &s.template)
}

fn replicaset_template(r: &ReplicaSet) -> Option<&PodTemplateSpec> {
    r.spec.as_ref().and_then(|s| s.template.as_ref())
}

fn statefulset_template(s: &StatefulSet) -> Option<&PodTemplateSpec> {
    s.spec.as_ref().map(|spec| &spec.template)
}

fn job_template(j: &Job) -> Option<&PodTemplateSpec> {
    j.spec.as_ref().map(|s| &s.template)
}

fn cronjob_template(c: &CronJob) -> Option<&PodTemplateSpec> {
    c.spec.as_ref().and_then(|s| s.job_template.spec.as_ref()).map(|s| &s.template)
}

/// First owner reference, or the object itself.
fn owner_info(metadata: &ObjectMeta, resource_type: &str, own_name: &str) -> (String, String) {
    if let Some(owner) = metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .first()
    {
        (owner.kind.clone(), owner.name.clone())
    } else {
        (resource_type.to_string(), own_name.to_string())
    }
}

// --- EKS pod identity associations ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAssociationsResponse {
    #[serde(default)]
    associations: Vec<AssociationSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssociationSummary {
    association_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeAssociationResponse {
    association: Option<AssociationDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssociationDetail {
    namespace: String,
    service_account: String,
    role_arn: String,
}

async fn fetch_pod_identity_associations(
    credentials: &Arc<CredentialStore>,
    http: &reqwest::Client,
    cluster_name: &str,
) -> Result<HashMap<String, String>> {
    let list: ListAssociationsResponse = eks_get(
        credentials,
        http,
        &format!("/clusters/{}/pod-identity-associations", cluster_name),
    )
    .await?;

    let mut map = HashMap::new();
    for summary in list.associations {
        let Some(id) = summary.association_id else { continue };
        let described: DescribeAssociationResponse = eks_get(
            credentials,
            http,
            &format!("/clusters/{}/pod-identity-associations/{}", cluster_name, id),
        )
        .await?;
        if let Some(detail) = described.association {
            map.insert(
                format!("{}/{}", detail.namespace, detail.service_account),
                detail.role_arn,
            );
        }
    }
    Ok(map)
}

async fn eks_get<T: for<'de> Deserialize<'de>>(
    credentials: &Arc<CredentialStore>,
    http: &reqwest::Client,
    path: &str,
) -> Result<T> {
    let creds = credentials.current().await;
    let url: reqwest::Url = format!("https://eks.{}.amazonaws.com{}", creds.region, path)
        .parse()
        .map_err(|e| Error::Provider(format!("invalid EKS endpoint: {e}")))?;

    let mut headers = reqwest::header::HeaderMap::new();
    sigv4::sign_request(&creds, "eks", "GET", &url, &mut headers, b"", Utc::now());

    let response = http.get(url).headers(headers).send().await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(Error::Provider(format!(
            "EKS API call failed with {status}: {text}"
        )));
    }
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::EnvVar;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    #[test]
    fn owner_info_prefers_the_first_owner_reference() {
        let metadata = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                kind: "ReplicaSet".into(),
                name: "web-5d4f".into(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(
            owner_info(&metadata, "pod", "web-5d4f-abcde"),
            ("ReplicaSet".to_string(), "web-5d4f".to_string())
        );

        let unowned = ObjectMeta::default();
        assert_eq!(
            owner_info(&unowned, "deployment", "web"),
            ("deployment".to_string(), "web".to_string())
        );
    }

    #[test]
    fn azure_client_id_is_read_from_container_env() {
        let containers = vec![Container {
            name: "app".into(),
            env: Some(vec![EnvVar {
                name: "AZURE_CLIENT_ID".into(),
                value: Some("11111111-2222".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }];
        assert_eq!(env_client_id(&containers).as_deref(), Some("11111111-2222"));

        let empty_value = vec![Container {
            name: "app".into(),
            env: Some(vec![EnvVar {
                name: "AZURE_CLIENT_ID".into(),
                value: Some(String::new()),
                ..Default::default()
            }]),
            ..Default::default()
        }];
        assert!(env_client_id(&empty_value).is_none());
    }
}
