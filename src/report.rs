/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/report.rs
 *
 * The advise stage: canned queries over the finished permission table,
 * written as a JSON report with four sections: entities holding risky
 * permissions, workloads running as service accounts with risky
 * permissions, and roles/bindings whose permissions are entirely unused
 * inside the cutoff window.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use chrono::{NaiveDateTime, Utc};
use serde_json::{json, Value};
use sqlx::Row;
use std::path::PathBuf;
use tracing::info;

use crate::config::Settings;
use crate::error::Result;
use crate::store::PermissionStore;

/// Each SELECT yields the entity identity columns, a tagged risk reason and
/// the row's last-used timestamp.
const RISKY_PERMISSIONS_QUERY: &str = r#"
SELECT entity_name, entity_type, permission_source, permission_source_type,
       permission_binding, permission_binding_type,
       'Wide secret access permissions' AS risk_reason, last_used_time
FROM permission
WHERE resource_type = 'secrets' AND verb IN ('get', 'list')
GROUP BY entity_name, entity_type, permission_source, permission_source_type,
         permission_binding, permission_binding_type, last_used_time

UNION ALL

SELECT entity_name, entity_type, permission_source, permission_source_type,
       permission_binding, permission_binding_type,
       'nodes/proxy access permissions' AS risk_reason, last_used_time
FROM permission
WHERE resource_type = 'nodes/proxy' AND verb IN ('create', 'get') AND permission_scope = 'cluster-wide'
GROUP BY entity_name, entity_type, permission_source, permission_source_type,
         permission_binding, permission_binding_type, last_used_time
HAVING COUNT(DISTINCT verb) = 2

UNION ALL

SELECT entity_name, entity_type, permission_source, permission_source_type,
       permission_binding, permission_binding_type,
       'serviceaccount token creation permissions' AS risk_reason, last_used_time
FROM permission
WHERE resource_type = 'serviceaccounts/token' AND verb = 'create'
GROUP BY entity_name, entity_type, permission_source, permission_source_type,
         permission_binding, permission_binding_type, last_used_time

UNION ALL

SELECT entity_name, entity_type, permission_source, permission_source_type,
       permission_binding, permission_binding_type,
       'Escalate, bind or impersonate permissions' AS risk_reason, last_used_time
FROM permission
WHERE verb IN ('escalate', 'bind', 'impersonate') AND permission_scope = 'cluster-wide'
GROUP BY entity_name, entity_type, permission_source, permission_source_type,
         permission_binding, permission_binding_type, last_used_time

UNION ALL

SELECT a.entity_name, a.entity_type, a.permission_source, a.permission_source_type,
       a.permission_binding, a.permission_binding_type,
       'CSR and certificate issuing permissions' AS risk_reason, a.last_used_time
FROM (
    SELECT entity_name, entity_type, permission_source, permission_source_type,
           permission_binding, permission_binding_type, last_used_time
    FROM permission
    WHERE resource_type = 'certificatesigningrequests' AND verb = 'create' AND permission_scope = 'cluster-wide'
    GROUP BY entity_name, entity_type, permission_source, permission_source_type,
             permission_binding, permission_binding_type, last_used_time
) AS a
INNER JOIN (
    SELECT entity_name, entity_type, permission_source, permission_source_type,
           permission_binding, permission_binding_type, last_used_time
    FROM permission
    WHERE resource_type = 'certificatesigningrequests/approval' AND verb IN ('patch', 'update')
    GROUP BY entity_name, entity_type, permission_source, permission_source_type,
             permission_binding, permission_binding_type, last_used_time
) AS b
ON a.entity_name = b.entity_name AND a.entity_type = b.entity_type
AND a.permission_source = b.permission_source AND a.permission_source_type = b.permission_source_type
AND a.permission_binding = b.permission_binding AND a.permission_binding_type = b.permission_binding_type

UNION ALL

SELECT entity_name, entity_type, permission_source, permission_source_type,
       permission_binding, permission_binding_type,
       'Workload creation permissions' AS risk_reason, last_used_time
FROM permission
WHERE resource_type IN ('pods', 'deployments', 'statefulsets', 'replicasets', 'daemonsets', 'jobs', 'cronjobs')
AND verb = 'create'
GROUP BY entity_name, entity_type, permission_source, permission_source_type,
         permission_binding, permission_binding_type, last_used_time

UNION ALL

SELECT entity_name, entity_type, permission_source, permission_source_type,
       permission_binding, permission_binding_type,
       'PersistentVolume creation permissions' AS risk_reason, last_used_time
FROM permission
WHERE resource_type = 'persistentvolumes' AND verb = 'create' AND permission_scope = 'cluster-wide'
GROUP BY entity_name, entity_type, permission_source, permission_source_type,
         permission_binding, permission_binding_type, last_used_time

UNION ALL

SELECT entity_name, entity_type, permission_source, permission_source_type,
       permission_binding, permission_binding_type,
       'Admission webhook management permissions' AS risk_reason, last_used_time
FROM permission
WHERE resource_type IN ('validatingwebhookconfigurations', 'mutatingwebhookconfigurations')
AND verb IN ('create', 'delete', 'patch', 'update') AND permission_scope = 'cluster-wide'
GROUP BY entity_name, entity_type, permission_source, permission_source_type,
         permission_binding, permission_binding_type, last_used_time

ORDER BY entity_name, entity_type, risk_reason
"#;

/// The workload section narrows two rules (wide secret access must be
/// cluster-wide; workload creation must hit cluster-wide or kube-system)
/// and joins the result against the collected service accounts.
const WORKLOADS_QUERY: &str = r#"
WITH risky_permissions AS (
    SELECT DISTINCT entity_name, risk_reason
    FROM (
        SELECT entity_name, 'Wide secret access permissions' AS risk_reason
        FROM permission
        WHERE resource_type = 'secrets' AND verb IN ('get', 'list') AND permission_scope = 'cluster-wide'
        GROUP BY entity_name

        UNION ALL

        SELECT entity_name, 'nodes/proxy access permissions' AS risk_reason
        FROM permission
        WHERE resource_type = 'nodes/proxy' AND verb IN ('create', 'get') AND permission_scope = 'cluster-wide'
        GROUP BY entity_name
        HAVING COUNT(DISTINCT verb) = 2

        UNION ALL

        SELECT entity_name, 'serviceaccount token creation permissions' AS risk_reason
        FROM permission
        WHERE resource_type = 'serviceaccounts/token' AND verb = 'create'
        GROUP BY entity_name

        UNION ALL

        SELECT entity_name, 'Escalate, bind or impersonate permissions' AS risk_reason
        FROM permission
        WHERE verb IN ('escalate', 'bind', 'impersonate') AND permission_scope = 'cluster-wide'
        GROUP BY entity_name

        UNION ALL

        SELECT a.entity_name, 'CSR and certificate issuing permissions' AS risk_reason
        FROM (
            SELECT entity_name
            FROM permission
            WHERE resource_type = 'certificatesigningrequests' AND verb = 'create' AND permission_scope = 'cluster-wide'
            GROUP BY entity_name
        ) AS a
        INNER JOIN (
            SELECT entity_name
            FROM permission
            WHERE resource_type = 'certificatesigningrequests/approval' AND verb IN ('patch', 'update')
            GROUP BY entity_name
        ) AS b
        ON a.entity_name = b.entity_name

        UNION ALL

        SELECT entity_name, 'Workload creation permissions' AS risk_reason
        FROM permission
        WHERE resource_type IN ('pods', 'deployments', 'statefulsets', 'replicasets', 'daemonsets', 'jobs', 'cronjobs')
        AND verb = 'create' AND permission_scope IN ('cluster-wide', 'kube-system')
        GROUP BY entity_name

        UNION ALL

        SELECT entity_name, 'PersistentVolume creation permissions' AS risk_reason
        FROM permission
        WHERE resource_type = 'persistentvolumes' AND verb = 'create' AND permission_scope = 'cluster-wide'
        GROUP BY entity_name

        UNION ALL

        SELECT entity_name, 'Admission webhook management permissions' AS risk_reason
        FROM permission
        WHERE resource_type IN ('validatingwebhookconfigurations', 'mutatingwebhookconfigurations')
        AND verb IN ('create', 'delete', 'patch', 'update') AND permission_scope = 'cluster-wide'
        GROUP BY entity_name
    ) AS all_risks
)
SELECT w.workload_type, w.workload_name, w.service_account_name, rp.risk_reason
FROM workload_identities w
INNER JOIN risky_permissions rp ON w.service_account_name = rp.entity_name
ORDER BY w.workload_type, w.workload_name
"#;

const UNUSED_ROLES_QUERY: &str = r#"
SELECT
    permission_source AS rbac_object,
    permission_source_type AS rbac_type,
    COUNT(*) AS unused_permission_count
FROM permission
WHERE (last_used_time IS NULL OR last_used_time < datetime('now', ?1))
  AND permission_source_type IN ('Role', 'ClusterRole')
  AND permission_source NOT IN (
      SELECT permission_source
      FROM permission
      WHERE last_used_time >= datetime('now', ?1)
        AND permission_source_type IN ('Role', 'ClusterRole')
  )
GROUP BY permission_source, permission_source_type
ORDER BY unused_permission_count DESC
"#;

const UNUSED_BINDINGS_QUERY: &str = r#"
SELECT
    permission_binding AS rbac_object,
    permission_binding_type AS rbac_type,
    COUNT(*) AS unused_permission_count
FROM permission
WHERE (last_used_time IS NULL OR last_used_time < datetime('now', ?1))
  AND permission_binding_type IN ('RoleBinding', 'ClusterRoleBinding')
  AND permission_binding NOT IN (
      SELECT permission_binding
      FROM permission
      WHERE last_used_time >= datetime('now', ?1)
        AND permission_binding_type IN ('RoleBinding', 'ClusterRoleBinding')
  )
GROUP BY permission_binding, permission_binding_type
ORDER BY unused_permission_count DESC
"#;

/// Builds the four-section report document.
pub async fn build_report(store: &PermissionStore, settings: &Settings) -> Result<Value> {
    let cutoff = format!("-{} days", settings.unused_entity_days);

    let mut risky_permissions = Vec::new();
    for row in sqlx::query(RISKY_PERMISSIONS_QUERY)
        .fetch_all(store.pool())
        .await?
    {
        let risk_reason: String = row.get("risk_reason");
        let last_used_time: Option<String> = row.get("last_used_time");
        risky_permissions.push(json!({
            "entity_name": row.get::<String, _>("entity_name"),
            "entity_type": row.get::<String, _>("entity_type"),
            "permission_source": row.get::<String, _>("permission_source"),
            "permission_source_type": row.get::<String, _>("permission_source_type"),
            "permission_binding": row.get::<String, _>("permission_binding"),
            "permission_binding_type": row.get::<String, _>("permission_binding_type"),
            "risk_reason": risk_reason.to_uppercase(),
            "last_used_time_or_unused_duration": render_last_used(last_used_time.as_deref()),
        }));
    }

    let mut workloads = Vec::new();
    if store.workload_count().await? != 0 {
        for row in sqlx::query(WORKLOADS_QUERY).fetch_all(store.pool()).await? {
            let risk_reason: String = row.get("risk_reason");
            workloads.push(json!({
                "workload_type": row.get::<String, _>("workload_type"),
                "workload_name": row.get::<String, _>("workload_name"),
                "service_account_name": row.get::<String, _>("service_account_name"),
                "risk_reason": risk_reason.to_uppercase(),
            }));
        }
    }

    let mut unused_roles = Vec::new();
    for row in sqlx::query(UNUSED_ROLES_QUERY)
        .bind(&cutoff)
        .fetch_all(store.pool())
        .await?
    {
        unused_roles.push(json!({
            "role_name": row.get::<String, _>("rbac_object"),
            "role_type": row.get::<String, _>("rbac_type"),
            "unused_permission_count": row.get::<i64, _>("unused_permission_count"),
        }));
    }

    let mut unused_bindings = Vec::new();
    for row in sqlx::query(UNUSED_BINDINGS_QUERY)
        .bind(&cutoff)
        .fetch_all(store.pool())
        .await?
    {
        unused_bindings.push(json!({
            "binding_name": row.get::<String, _>("rbac_object"),
            "binding_type": row.get::<String, _>("rbac_type"),
            "unused_permission_count": row.get::<i64, _>("unused_permission_count"),
        }));
    }

    Ok(json!({
        "risky_permissions": risky_permissions,
        "workloads_with_risky_permissions": workloads,
        "unused_roles": unused_roles,
        "unused_bindings": unused_bindings,
    }))
}

/// Writes `kiempossible_report_<YYYYMMDD>.json` into the working directory.
pub async fn write_report(store: &PermissionStore, settings: &Settings) -> Result<PathBuf> {
    println!("\nPreparing output report...");
    let report = build_report(store, settings).await?;
    let path = PathBuf::from(format!(
        "kiempossible_report_{}.json",
        Utc::now().format("%Y%m%d")
    ));
    tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?).await?;
    info!(path = %path.display(), "advise report written");
    println!(
        "NOTICE: Unused permissions observed in the ingestion timeframe are shown with a last \
         used time. Unused permissions not observed are shown without. Explore the database for \
         more information."
    );
    Ok(path)
}

fn render_last_used(last_used_time: Option<&str>) -> String {
    let Some(raw) = last_used_time.filter(|t| !t.is_empty()) else {
        return "UNUSED in the observed period".to_string();
    };
    let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") else {
        return format!("Parse error: {}", raw);
    };
    let unused_for = Utc::now().naive_utc() - parsed;
    if unused_for.num_days() >= 1 {
        format!("UNUSED for at least {} days", unused_for.num_days())
    } else {
        format!("UNUSED for at least {} hours", unused_for.num_hours())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PermissionRow, WorkloadIdentity};

    fn row(
        entity: &str,
        resource_type: &str,
        verb: &str,
        scope: &str,
        source: &str,
        binding: &str,
    ) -> PermissionRow {
        PermissionRow {
            entity_name: entity.into(),
            entity_type: "ServiceAccount".into(),
            api_group: "v1".into(),
            resource_type: resource_type.into(),
            verb: verb.into(),
            permission_scope: scope.into(),
            permission_source: source.into(),
            permission_source_type: "Role".into(),
            permission_binding: binding.into(),
            permission_binding_type: "RoleBinding".into(),
            last_used_time: None,
            last_used_resource: None,
        }
    }

    fn settings() -> Settings {
        Settings {
            log_days: 7,
            log_concurrency: None,
            gcp_page_size: 1_000_000,
            unused_entity_days: 7,
            db_path: ":memory:".into(),
        }
    }

    #[tokio::test]
    async fn secret_access_is_flagged_risky() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store
            .insert_permission(&row("dev:app", "secrets", "get", "dev", "secret-reader", "srb"))
            .await
            .unwrap();

        let report = build_report(&store, &settings()).await.unwrap();
        let risky = report["risky_permissions"].as_array().unwrap();
        assert_eq!(risky.len(), 1);
        assert_eq!(
            risky[0]["risk_reason"].as_str().unwrap(),
            "WIDE SECRET ACCESS PERMISSIONS"
        );
        assert_eq!(
            risky[0]["last_used_time_or_unused_duration"].as_str().unwrap(),
            "UNUSED in the observed period"
        );
    }

    #[tokio::test]
    async fn nodes_proxy_requires_both_verbs() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store
            .insert_permission(&row("a", "nodes/proxy", "get", "cluster-wide", "r", "b"))
            .await
            .unwrap();

        let report = build_report(&store, &settings()).await.unwrap();
        assert!(report["risky_permissions"].as_array().unwrap().is_empty());

        store
            .insert_permission(&row("a", "nodes/proxy", "create", "cluster-wide", "r", "b"))
            .await
            .unwrap();
        let report = build_report(&store, &settings()).await.unwrap();
        assert_eq!(report["risky_permissions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn csr_rule_requires_create_and_approval() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store
            .insert_permission(&row(
                "ca",
                "certificatesigningrequests",
                "create",
                "cluster-wide",
                "csr-role",
                "csr-binding",
            ))
            .await
            .unwrap();

        let report = build_report(&store, &settings()).await.unwrap();
        assert!(report["risky_permissions"].as_array().unwrap().is_empty());

        store
            .insert_permission(&row(
                "ca",
                "certificatesigningrequests/approval",
                "update",
                "cluster-wide",
                "csr-role",
                "csr-binding",
            ))
            .await
            .unwrap();
        let report = build_report(&store, &settings()).await.unwrap();
        let risky = report["risky_permissions"].as_array().unwrap();
        assert_eq!(risky.len(), 1);
        assert_eq!(
            risky[0]["risk_reason"].as_str().unwrap(),
            "CSR AND CERTIFICATE ISSUING PERMISSIONS"
        );
    }

    #[tokio::test]
    async fn workloads_join_against_risky_service_accounts() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store
            .insert_permission(&row(
                "dev:app",
                "serviceaccounts/token",
                "create",
                "dev",
                "token-role",
                "token-binding",
            ))
            .await
            .unwrap();
        store
            .upsert_workload(&WorkloadIdentity {
                workload_type: "Deployment".into(),
                workload_name: "web".into(),
                service_account_name: "dev:app".into(),
                workload_identity: String::new(),
                original_owner_type: "deployment".into(),
                original_owner_name: "web".into(),
            })
            .await
            .unwrap();

        let report = build_report(&store, &settings()).await.unwrap();
        let workloads = report["workloads_with_risky_permissions"].as_array().unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0]["workload_name"].as_str().unwrap(), "web");
    }

    #[tokio::test]
    async fn unused_roles_exclude_recently_used_sources() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        // Never used.
        store
            .insert_permission(&row("a", "pods", "get", "dev", "stale-role", "stale-binding"))
            .await
            .unwrap();
        // Used just now.
        let mut fresh = row("b", "pods", "list", "dev", "active-role", "active-binding");
        fresh.last_used_time = Some(
            Utc::now()
                .naive_utc()
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        );
        store.insert_permission(&fresh).await.unwrap();

        let report = build_report(&store, &settings()).await.unwrap();
        let unused = report["unused_roles"].as_array().unwrap();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0]["role_name"].as_str().unwrap(), "stale-role");

        let unused_bindings = report["unused_bindings"].as_array().unwrap();
        assert_eq!(unused_bindings.len(), 1);
        assert_eq!(
            unused_bindings[0]["binding_name"].as_str().unwrap(),
            "stale-binding"
        );
    }

    #[test]
    fn last_used_rendering() {
        assert_eq!(render_last_used(None), "UNUSED in the observed period");
        assert_eq!(render_last_used(Some("")), "UNUSED in the observed period");
        assert!(render_last_used(Some("2020-01-01 00:00:00")).starts_with("UNUSED for at least"));
        assert!(render_last_used(Some("garbage")).starts_with("Parse error"));
    }
}
