/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/normalize/mod.rs
 *
 * The canonical audit event and the normalization rules that project it onto
 * the permission table's column vocabulary. Every provider-specific record
 * format (CloudWatch, Log Analytics, Cloud Logging, local audit files) is
 * reduced to `AuditEvent` by the parsers in `providers.rs`; the helpers here
 * turn its fields into entity names, api-group strings, scopes and SQL
 * timestamps.
 *
 * SPDX-License-Identifier: Apache-2.0 */

pub mod providers;

use chrono::{DateTime, NaiveDateTime};

const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// A provider-independent audit event, carrying exactly the fields the
/// correlator needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditEvent {
    pub verb: String,
    pub username: String,
    pub groups: Vec<String>,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub namespace: String,
    pub name: String,
    /// Already coerced to `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    /// The `authorization.k8s.io/reason` annotation, when present (EKS).
    pub authorization_reason: String,
}

/// Splits a username into `(entity_name, entity_type)`.
///
/// `system:serviceaccount:<ns>:<name>` becomes `<ns>:<name>` with type
/// `ServiceAccount`; every other username is a `User`.
pub fn entity_name_and_type(username: &str) -> (String, String) {
    if let Some(rest) = username.strip_prefix(SERVICE_ACCOUNT_PREFIX) {
        (rest.to_string(), "ServiceAccount".to_string())
    } else {
        (username.to_string(), "User".to_string())
    }
}

/// Composes the stored api-group string: the bare version for the core group,
/// `group/version` otherwise.
pub fn compose_api_group(api_group: &str, api_version: &str) -> String {
    if api_group.is_empty() {
        api_version.to_string()
    } else {
        format!("{}/{}", api_group, api_version)
    }
}

/// `resource` or `resource/subresource`.
pub fn compose_resource_type(resource: &str, subresource: &str) -> String {
    if subresource.is_empty() {
        resource.to_string()
    } else {
        format!("{}/{}", resource, subresource)
    }
}

/// Normalizes `(namespace, name)` into the stored permission scope.
pub fn permission_scope(namespace: &str, name: &str) -> String {
    match (namespace.is_empty(), name.is_empty()) {
        (false, false) => format!("{}/{}", namespace, name),
        (true, false) => format!("cluster-wide/{}", name),
        (false, true) => namespace.to_string(),
        (true, true) => "cluster-wide".to_string(),
    }
}

/// The human-facing `last_used_resource` string.
pub fn last_used_resource(namespace: &str, resource_type: &str, name: &str) -> String {
    match (namespace.is_empty(), name.is_empty()) {
        (false, false) => format!("{}/{}/{}", namespace, resource_type, name),
        (true, false) => format!("{}/{}", resource_type, name),
        (false, true) => format!("{}/{}", namespace, resource_type),
        (true, true) => resource_type.to_string(),
    }
}

/// Coerces an RFC 3339 timestamp into the store's local SQL format.
/// Returns an empty string when the input does not parse; the correlator
/// drops such records.
pub fn sql_timestamp(rfc3339: &str) -> String {
    match DateTime::parse_from_rfc3339(rfc3339) {
        Ok(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => String::new(),
    }
}

/// Lenient variant for providers that already emit `T`-separated local
/// timestamps with fractional seconds (Azure Log Analytics).
pub fn sql_timestamp_lenient(raw: &str) -> String {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return t.format("%Y-%m-%d %H:%M:%S").to_string();
    }
    let spaced = raw.replacen('T', " ", 1);
    let trimmed = spaced.split('.').next().unwrap_or("").trim_end_matches('Z');
    match NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        Ok(_) => trimmed.to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_account_usernames_are_split() {
        let (name, kind) = entity_name_and_type("system:serviceaccount:dev:app");
        assert_eq!(name, "dev:app");
        assert_eq!(kind, "ServiceAccount");

        let (name, kind) = entity_name_and_type("alice@example.com");
        assert_eq!(name, "alice@example.com");
        assert_eq!(kind, "User");

        // Node identities and other system users stay users.
        let (name, kind) = entity_name_and_type("system:node:ip-10-0-0-1");
        assert_eq!(name, "system:node:ip-10-0-0-1");
        assert_eq!(kind, "User");
    }

    #[test]
    fn api_group_composition() {
        assert_eq!(compose_api_group("", "v1"), "v1");
        assert_eq!(compose_api_group("apps", "v1"), "apps/v1");
        assert_eq!(
            compose_api_group("rbac.authorization.k8s.io", "v1"),
            "rbac.authorization.k8s.io/v1"
        );
    }

    #[test]
    fn resource_type_composition() {
        assert_eq!(compose_resource_type("pods", ""), "pods");
        assert_eq!(compose_resource_type("pods", "exec"), "pods/exec");
    }

    #[test]
    fn scope_normalization_table() {
        assert_eq!(permission_scope("dev", "web"), "dev/web");
        assert_eq!(permission_scope("", "node-1"), "cluster-wide/node-1");
        assert_eq!(permission_scope("dev", ""), "dev");
        assert_eq!(permission_scope("", ""), "cluster-wide");
    }

    #[test]
    fn last_used_resource_forms() {
        assert_eq!(last_used_resource("dev", "pods", "web"), "dev/pods/web");
        assert_eq!(last_used_resource("", "nodes", "node-1"), "nodes/node-1");
        assert_eq!(last_used_resource("dev", "pods", ""), "dev/pods");
        assert_eq!(last_used_resource("", "namespaces", ""), "namespaces");
    }

    #[test]
    fn timestamps_are_coerced_to_sql_format() {
        assert_eq!(
            sql_timestamp("2024-03-01T12:34:56Z"),
            "2024-03-01 12:34:56"
        );
        assert_eq!(
            sql_timestamp("2024-03-01T12:34:56.789+02:00"),
            "2024-03-01 12:34:56"
        );
        assert_eq!(sql_timestamp("not-a-timestamp"), "");
    }

    #[test]
    fn lenient_timestamps_accept_fractional_t_separated_forms() {
        assert_eq!(
            sql_timestamp_lenient("2024-03-01T12:34:56.1234567Z"),
            "2024-03-01 12:34:56"
        );
        assert_eq!(
            sql_timestamp_lenient("2024-03-01T12:34:56Z"),
            "2024-03-01 12:34:56"
        );
        assert_eq!(sql_timestamp_lenient("garbage"), "");
    }
}
