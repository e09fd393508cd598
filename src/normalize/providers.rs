/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/normalize/providers.rs
 *
 * Projections from provider-specific spill-file lines onto the canonical
 * `AuditEvent`. Each parser is total over its input: a line that does not
 * match the expected shape yields `None` and the correlator skips it after
 * logging, so a single malformed record never aborts a run.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use serde::Deserialize;
use serde_json::Value;

use super::{sql_timestamp, sql_timestamp_lenient, AuditEvent};

// --- Kubernetes audit event (AWS CloudWatch and local files) ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct K8sAuditRecord {
    verb: String,
    stage: String,
    user: K8sUser,
    #[serde(rename = "objectRef")]
    object_ref: K8sObjectRef,
    #[serde(rename = "requestReceivedTimestamp")]
    request_received_timestamp: String,
    #[serde(rename = "responseStatus")]
    response_status: K8sResponseStatus,
    annotations: K8sAnnotations,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct K8sUser {
    username: String,
    groups: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct K8sObjectRef {
    resource: String,
    subresource: String,
    namespace: String,
    name: String,
    #[serde(rename = "apiGroup")]
    api_group: String,
    #[serde(rename = "apiVersion")]
    api_version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct K8sResponseStatus {
    code: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct K8sAnnotations {
    #[serde(rename = "authorization.k8s.io/reason")]
    reason: String,
}

impl K8sAuditRecord {
    fn into_event(self) -> AuditEvent {
        AuditEvent {
            verb: self.verb,
            username: self.user.username,
            groups: self.user.groups,
            api_group: self.object_ref.api_group,
            api_version: self.object_ref.api_version,
            resource: self.object_ref.resource,
            subresource: self.object_ref.subresource,
            namespace: self.object_ref.namespace,
            name: self.object_ref.name,
            timestamp: sql_timestamp(&self.request_received_timestamp),
            authorization_reason: self.annotations.reason,
        }
    }
}

/// CloudWatch spill lines are `FilteredLogEvent` objects whose `message`
/// field holds the audit event JSON. The server-side filter pattern already
/// restricted them to successful ResponseComplete events.
pub fn parse_aws_line(line: &str) -> Option<AuditEvent> {
    #[derive(Deserialize)]
    struct FilteredLogEvent {
        message: String,
    }
    let outer: FilteredLogEvent = serde_json::from_str(line).ok()?;
    let record: K8sAuditRecord = serde_json::from_str(&outer.message).ok()?;
    Some(record.into_event())
}

/// Local audit files carry raw apiserver audit events at every stage; only
/// successful ResponseComplete events are kept.
pub fn parse_local_line(line: &str) -> Option<AuditEvent> {
    let record: K8sAuditRecord = serde_json::from_str(line).ok()?;
    if record.stage != "ResponseComplete" || record.response_status.code != 200 {
        return None;
    }
    Some(record.into_event())
}

// --- Azure Log Analytics ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AzureUserInfo {
    username: String,
    groups: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AzureObjectRef {
    resource: String,
    namespace: String,
    name: String,
    #[serde(rename = "apiGroup")]
    api_group: String,
    #[serde(rename = "apiVersion")]
    api_version: String,
    subresource: String,
}

/// Dynamic KQL columns arrive either as embedded JSON strings or as plain
/// objects depending on the projection; accept both.
fn decode_cell<T: for<'de> Deserialize<'de>>(cell: &Value) -> Option<T> {
    match cell {
        Value::String(s) => serde_json::from_str(s).ok(),
        other => serde_json::from_value(other.clone()).ok(),
    }
}

/// Spill lines are row arrays `[TimeGenerated, Verb, User, ObjectRef]` as
/// projected by the AKSAudit query.
pub fn parse_azure_line(line: &str) -> Option<AuditEvent> {
    let row: Vec<Value> = serde_json::from_str(line).ok()?;
    if row.len() < 4 {
        return None;
    }
    let time_generated = row[0].as_str()?;
    let verb = row[1].as_str()?;
    let user: AzureUserInfo = decode_cell(&row[2])?;
    let object_ref: AzureObjectRef = decode_cell(&row[3])?;

    Some(AuditEvent {
        verb: verb.to_string(),
        username: user.username,
        groups: user.groups,
        api_group: object_ref.api_group,
        api_version: object_ref.api_version,
        resource: object_ref.resource,
        subresource: object_ref.subresource,
        namespace: object_ref.namespace,
        name: object_ref.name,
        timestamp: sql_timestamp_lenient(time_generated),
        authorization_reason: String::new(),
    })
}

// --- GCP Cloud Logging ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GcpEntry {
    #[serde(rename = "protoPayload", alias = "payload")]
    proto_payload: GcpProtoPayload,
    timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GcpProtoPayload {
    #[serde(rename = "authenticationInfo", alias = "authentication_info")]
    authentication_info: GcpAuthenticationInfo,
    #[serde(rename = "authorizationInfo", alias = "authorization_info")]
    authorization_info: Vec<GcpAuthorizationInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GcpAuthenticationInfo {
    #[serde(rename = "principalEmail", alias = "principal_email")]
    principal_email: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GcpAuthorizationInfo {
    permission: String,
    resource: String,
}

/// Decodes a Cloud Logging audit entry. The verb is the trailing segment of
/// the IAM permission string; the resource path is matched against the four
/// shapes GKE emits to recover group, version, namespace, resource and name.
pub fn parse_gcp_line(line: &str) -> Option<AuditEvent> {
    let entry: GcpEntry = serde_json::from_str(line).ok()?;
    let principal = entry.proto_payload.authentication_info.principal_email;
    if principal.is_empty() {
        return None;
    }
    let authz = entry.proto_payload.authorization_info.first()?;

    let parts: Vec<&str> = authz.permission.split('.').collect();
    if parts.len() < 4 {
        return None;
    }
    let verb = parts[parts.len() - 1];

    let resource_parts: Vec<&str> = authz.resource.split('/').collect();
    let (api_group, api_version, namespace, resource, name) = match resource_parts.as_slice() {
        // {apiGroup}/{apiVersion}/namespaces/{namespace}/{resourceType}/{resourceName}
        [group, version, "namespaces", ns, rt, rest @ ..] if !rest.is_empty() => {
            (*group, *version, *ns, *rt, rest[0])
        }
        // {apiGroup}/{apiVersion}/namespaces/{namespace}/{resourceType}
        [group, version, "namespaces", ns, rt] => (*group, *version, *ns, *rt, ""),
        // {apiGroup}/{apiVersion}/{resourceType}/{resourceName}
        [group, version, rt, rn] => (*group, *version, "", *rt, *rn),
        // {apiGroup}/{apiVersion}/{resourceType}
        [group, version, rt] => (*group, *version, "", *rt, ""),
        _ => ("", "", "", "", ""),
    };

    Some(AuditEvent {
        verb: verb.to_string(),
        username: principal,
        groups: Vec::new(),
        api_group: api_group.to_string(),
        api_version: api_version.to_string(),
        resource: resource.to_string(),
        subresource: String::new(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        timestamp: sql_timestamp(&entry.timestamp),
        authorization_reason: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_lines_unwrap_the_cloudwatch_envelope() {
        let inner = r#"{"verb":"get","user":{"username":"system:serviceaccount:dev:app","groups":["system:serviceaccounts"]},"objectRef":{"resource":"pods","namespace":"dev","name":"web","apiVersion":"v1"},"requestReceivedTimestamp":"2024-03-01T12:00:00Z","annotations":{"authorization.k8s.io/reason":"RBAC: allowed"}}"#;
        let line = serde_json::json!({
            "logStreamName": "kube-apiserver-audit-1",
            "timestamp": 1_709_294_400_000_i64,
            "message": inner,
        })
        .to_string();

        let event = parse_aws_line(&line).expect("parses");
        assert_eq!(event.verb, "get");
        assert_eq!(event.username, "system:serviceaccount:dev:app");
        assert_eq!(event.resource, "pods");
        assert_eq!(event.namespace, "dev");
        assert_eq!(event.timestamp, "2024-03-01 12:00:00");
        assert_eq!(event.authorization_reason, "RBAC: allowed");
    }

    #[test]
    fn local_lines_filter_on_stage_and_status() {
        let ok = r#"{"verb":"list","stage":"ResponseComplete","user":{"username":"alice"},"objectRef":{"resource":"secrets","namespace":"dev","apiVersion":"v1"},"requestReceivedTimestamp":"2024-03-01T09:00:00Z","responseStatus":{"code":200}}"#;
        assert!(parse_local_line(ok).is_some());

        let forbidden = ok.replace("\"code\":200", "\"code\":403");
        assert!(parse_local_line(&forbidden).is_none());

        let request_stage = ok.replace("ResponseComplete", "RequestReceived");
        assert!(parse_local_line(&request_stage).is_none());
    }

    #[test]
    fn azure_rows_decode_embedded_json_cells() {
        let line = serde_json::json!([
            "2024-03-01T10:00:00.1234567Z",
            "watch",
            r#"{"username":"bob","groups":["system:masters"]}"#,
            r#"{"resource":"configmaps","namespace":"prod","name":"","apiGroup":"","apiVersion":"v1","subresource":""}"#,
        ])
        .to_string();

        let event = parse_azure_line(&line).expect("parses");
        assert_eq!(event.verb, "watch");
        assert_eq!(event.username, "bob");
        assert_eq!(event.groups, vec!["system:masters"]);
        assert_eq!(event.namespace, "prod");
        assert_eq!(event.timestamp, "2024-03-01 10:00:00");
    }

    #[test]
    fn gcp_namespaced_resource_path_with_name() {
        let line = serde_json::json!({
            "timestamp": "2024-03-01T08:00:00Z",
            "protoPayload": {
                "authenticationInfo": {"principalEmail": "dev@example.iam.gserviceaccount.com"},
                "authorizationInfo": [{
                    "permission": "io.k8s.core.v1.pods.get",
                    "resource": "core/v1/namespaces/dev/pods/web-0",
                }],
            },
        })
        .to_string();

        let event = parse_gcp_line(&line).expect("parses");
        assert_eq!(event.verb, "get");
        assert_eq!(event.username, "dev@example.iam.gserviceaccount.com");
        assert_eq!(event.api_group, "core");
        assert_eq!(event.api_version, "v1");
        assert_eq!(event.namespace, "dev");
        assert_eq!(event.resource, "pods");
        assert_eq!(event.name, "web-0");
    }

    #[test]
    fn gcp_cluster_scoped_resource_path() {
        let line = serde_json::json!({
            "timestamp": "2024-03-01T08:00:00Z",
            "protoPayload": {
                "authenticationInfo": {"principalEmail": "admin@example.com"},
                "authorizationInfo": [{
                    "permission": "io.k8s.core.v1.nodes.list",
                    "resource": "core/v1/nodes",
                }],
            },
        })
        .to_string();

        let event = parse_gcp_line(&line).expect("parses");
        assert_eq!(event.verb, "list");
        assert_eq!(event.resource, "nodes");
        assert_eq!(event.name, "");
        assert_eq!(event.namespace, "");
    }

    #[test]
    fn gcp_cluster_scoped_resource_path_with_name() {
        let line = serde_json::json!({
            "timestamp": "2024-03-01T08:00:00Z",
            "protoPayload": {
                "authenticationInfo": {"principalEmail": "admin@example.com"},
                "authorizationInfo": [{
                    "permission": "io.k8s.core.v1.nodes.get",
                    "resource": "core/v1/nodes/node-1",
                }],
            },
        })
        .to_string();

        let event = parse_gcp_line(&line).expect("parses");
        assert_eq!(event.resource, "nodes");
        assert_eq!(event.name, "node-1");
    }
}
