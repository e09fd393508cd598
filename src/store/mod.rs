/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/store/mod.rs
 *
 * The permission store: a SQLite-backed table of flattened permission tuples
 * plus the workload-identity table. The full set of non-mutable columns is
 * covered by a unique index, so inserts are idempotent (`INSERT OR IGNORE`)
 * and re-runs within one execution can never clobber the mutable
 * `last_used_time` / `last_used_resource` columns.
 *
 * Both tables are rebuilt from scratch at the start of every run: a single
 * transaction clears them and resets the autoincrement counters.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::Result;

/// One flattened permission tuple, keyed by every column except the two
/// mutable last-used fields.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PermissionRow {
    pub entity_name: String,
    pub entity_type: String,
    pub api_group: String,
    pub resource_type: String,
    pub verb: String,
    pub permission_scope: String,
    pub permission_source: String,
    pub permission_source_type: String,
    pub permission_binding: String,
    pub permission_binding_type: String,
    pub last_used_time: Option<String>,
    pub last_used_resource: Option<String>,
}

/// A workload and the service account it runs as.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadIdentity {
    pub workload_type: String,
    pub workload_name: String,
    pub service_account_name: String,
    pub workload_identity: String,
    pub original_owner_type: String,
    pub original_owner_name: String,
}

/// One observed use of a permission, queued for the batched update pass.
#[derive(Debug, Clone)]
pub struct UpdateData {
    pub entity_name: String,
    pub entity_type: String,
    pub api_group: String,
    pub resource_type: String,
    pub verb: String,
    pub permission_scope: String,
    pub last_used_time: String,
    pub last_used_resource: String,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS permission (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    api_group TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    verb TEXT NOT NULL,
    permission_scope TEXT NOT NULL,
    permission_source TEXT NOT NULL,
    permission_source_type TEXT NOT NULL,
    permission_binding TEXT NOT NULL,
    permission_binding_type TEXT NOT NULL,
    last_used_time TEXT,
    last_used_resource TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_permission_identity ON permission (
    entity_name, entity_type, api_group, resource_type, verb, permission_scope,
    permission_source, permission_source_type, permission_binding, permission_binding_type
);
CREATE TABLE IF NOT EXISTS workload_identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workload_type TEXT NOT NULL,
    workload_name TEXT NOT NULL,
    service_account_name TEXT NOT NULL,
    workload_identity TEXT NOT NULL DEFAULT '',
    original_owner_type TEXT NOT NULL DEFAULT '',
    original_owner_name TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_workload_identity ON workload_identities (
    workload_type, workload_name, service_account_name
);
"#;

const INSERT_PERMISSION: &str = r#"
INSERT OR IGNORE INTO permission (
    entity_name, entity_type, api_group, resource_type, verb, permission_scope,
    permission_source, permission_source_type, permission_binding, permission_binding_type,
    last_used_time, last_used_resource
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
"#;

/// Update predicate for one observed use. The scope clause lets an event
/// scoped `ns/name` touch a stored row scoped `ns`: the namespace-level
/// permission is the effective source of the access, while the richer
/// object path is retained in `last_used_resource`. The `IS NULL OR <`
/// clause keeps `last_used_time` monotonically non-decreasing.
const UPDATE_LAST_USED: &str = r#"
UPDATE permission
SET last_used_time = ?1, last_used_resource = ?2
WHERE entity_name = ?3 AND entity_type = ?4 AND api_group = ?5
  AND resource_type = ?6 AND verb = ?7
  AND (last_used_time IS NULL OR last_used_time < ?1)
  AND (permission_scope = ?8
       OR (?8 LIKE '%/%' AND permission_scope = substr(?8, 1, instr(?8, '/') - 1)))
"#;

/// Number of update rows applied per transaction.
pub const UPDATE_BATCH_SIZE: usize = 10_000;

#[derive(Clone)]
pub struct PermissionStore {
    pool: SqlitePool,
}

impl PermissionStore {
    /// Opens (creating if needed) the database file and applies the schema.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// An in-memory store, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        // A single connection keeps the in-memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Clears both tables and resets the autoincrement counters in a single
    /// transaction, so every run starts from an empty, id-1 table.
    pub async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM permission").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM workload_identities")
            .execute(&mut *tx)
            .await?;
        // sqlite_sequence only exists once an AUTOINCREMENT insert happened.
        if let Err(e) = sqlx::query(
            "DELETE FROM sqlite_sequence WHERE name IN ('permission', 'workload_identities')",
        )
        .execute(&mut *tx)
        .await
        {
            if !e.to_string().contains("no such table") {
                return Err(e.into());
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Idempotent insert: duplicate tuples are ignored, mutable fields of
    /// existing rows are untouched.
    pub async fn insert_permission(&self, row: &PermissionRow) -> Result<()> {
        bind_row(sqlx::query(INSERT_PERMISSION), row)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts a batch of permission rows inside one transaction.
    pub async fn insert_permissions(&self, rows: &[PermissionRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            bind_row(sqlx::query(INSERT_PERMISSION), row)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Applies observed-use updates in transactions of `UPDATE_BATCH_SIZE`
    /// rows. A failure rolls the current transaction back and aborts.
    pub async fn apply_usage_batch(&self, updates: &[UpdateData]) -> Result<()> {
        for chunk in updates.chunks(UPDATE_BATCH_SIZE) {
            let mut tx = self.pool.begin().await?;
            for data in chunk {
                sqlx::query(UPDATE_LAST_USED)
                    .bind(&data.last_used_time)
                    .bind(&data.last_used_resource)
                    .bind(&data.entity_name)
                    .bind(&data.entity_type)
                    .bind(&data.api_group)
                    .bind(&data.resource_type)
                    .bind(&data.verb)
                    .bind(&data.permission_scope)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// Every permission row currently owned by `entity_name` (used to expand
    /// group grants onto observed principals).
    pub async fn rows_for_entity(&self, entity_name: &str) -> Result<Vec<PermissionRow>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT entity_name, entity_type, api_group, resource_type, verb, permission_scope,
                   permission_source, permission_source_type, permission_binding,
                   permission_binding_type, last_used_time, last_used_resource
            FROM permission
            WHERE entity_name = ?1
            "#,
        )
        .bind(entity_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Distinct `(api_group, resource_type, verb)` tuples, optionally
    /// restricted to the read-only verbs.
    pub async fn distinct_permission_tuples(
        &self,
        view_only: bool,
    ) -> Result<Vec<(String, String, String)>> {
        let sql = if view_only {
            "SELECT DISTINCT api_group, resource_type, verb FROM permission \
             WHERE verb IN ('get', 'list', 'watch')"
        } else {
            "SELECT DISTINCT api_group, resource_type, verb FROM permission"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get(0), r.get(1), r.get(2)))
            .collect())
    }

    /// Distinct tuples whose scope sits inside the given namespace.
    pub async fn namespace_permission_tuples(
        &self,
        namespace: &str,
        view_only: bool,
    ) -> Result<Vec<(String, String, String, String)>> {
        let mut sql = String::from(
            "SELECT api_group, resource_type, verb, permission_scope FROM permission \
             WHERE (permission_scope = ?1 OR permission_scope LIKE ?2)",
        );
        if view_only {
            sql.push_str(" AND verb IN ('get', 'list', 'watch')");
        }
        sql.push_str(" GROUP BY api_group, resource_type, verb, permission_scope");
        let rows = sqlx::query(&sql)
            .bind(namespace)
            .bind(format!("{}/%", namespace))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get(0), r.get(1), r.get(2), r.get(3)))
            .collect())
    }

    /// Subresource types recorded under a parent resource in the same group.
    pub async fn subresources_of(&self, resource_type: &str, api_group: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT resource_type FROM permission \
             WHERE resource_type LIKE ?1 AND api_group = ?2 AND resource_type LIKE '%/%'",
        )
        .bind(format!("{}/%", resource_type))
        .bind(api_group)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    /// Infers whether a resource type is namespaced from the scopes already
    /// recorded for it: any scope whose first segment is a known namespace
    /// marks it namespaced.
    pub async fn is_resource_namespaced(
        &self,
        resource_type: &str,
        namespaces: &HashSet<String>,
    ) -> Result<bool> {
        if namespaces.is_empty() {
            return Ok(false);
        }
        let rows = sqlx::query(
            "SELECT DISTINCT permission_scope FROM permission WHERE resource_type = ?1",
        )
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let scope: String = row.get(0);
            let first = scope.split('/').next().unwrap_or("");
            if namespaces.contains(first) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Upserts one workload row; re-collection refreshes the mutable columns.
    pub async fn upsert_workload(&self, w: &WorkloadIdentity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workload_identities (
                workload_type, workload_name, service_account_name,
                workload_identity, original_owner_type, original_owner_name
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (workload_type, workload_name, service_account_name) DO UPDATE SET
                workload_identity = excluded.workload_identity,
                original_owner_type = excluded.original_owner_type,
                original_owner_name = excluded.original_owner_name
            "#,
        )
        .bind(&w.workload_type)
        .bind(&w.workload_name)
        .bind(&w.service_account_name)
        .bind(&w.workload_identity)
        .bind(&w.original_owner_type)
        .bind(&w.original_owner_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn workload_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM workload_identities")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    pub async fn permission_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM permission")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }
}

fn bind_row<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    row: &'q PermissionRow,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&row.entity_name)
        .bind(&row.entity_type)
        .bind(&row.api_group)
        .bind(&row.resource_type)
        .bind(&row.verb)
        .bind(&row.permission_scope)
        .bind(&row.permission_source)
        .bind(&row.permission_source_type)
        .bind(&row.permission_binding)
        .bind(&row.permission_binding_type)
        .bind(&row.last_used_time)
        .bind(&row.last_used_resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(scope: &str) -> PermissionRow {
        PermissionRow {
            entity_name: "alice".into(),
            entity_type: "User".into(),
            api_group: "v1".into(),
            resource_type: "pods".into(),
            verb: "get".into(),
            permission_scope: scope.into(),
            permission_source: "pod-reader".into(),
            permission_source_type: "Role".into(),
            permission_binding: "pod-reader-binding".into(),
            permission_binding_type: "RoleBinding".into(),
            last_used_time: None,
            last_used_resource: None,
        }
    }

    fn usage(scope: &str, time: &str) -> UpdateData {
        UpdateData {
            entity_name: "alice".into(),
            entity_type: "User".into(),
            api_group: "v1".into(),
            resource_type: "pods".into(),
            verb: "get".into(),
            permission_scope: scope.into(),
            last_used_time: time.into(),
            last_used_resource: "dev/pods/web".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_inserts_are_ignored() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        let row = sample_row("dev");
        store.insert_permission(&row).await.unwrap();
        store.insert_permission(&row).await.unwrap();
        assert_eq!(store.permission_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_resets_rows_and_sequence() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store.insert_permission(&sample_row("dev")).await.unwrap();
        store.clear_all().await.unwrap();
        assert_eq!(store.permission_count().await.unwrap(), 0);

        store.insert_permission(&sample_row("dev")).await.unwrap();
        let row = sqlx::query("SELECT id FROM permission")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let id: i64 = row.get(0);
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn event_scoped_to_object_updates_namespace_scoped_row() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store.insert_permission(&sample_row("dev")).await.unwrap();

        store
            .apply_usage_batch(&[usage("dev/web", "2024-03-01 12:00:00")])
            .await
            .unwrap();

        let rows = store.rows_for_entity("alice").await.unwrap();
        assert_eq!(
            rows[0].last_used_time.as_deref(),
            Some("2024-03-01 12:00:00")
        );
        assert_eq!(rows[0].last_used_resource.as_deref(), Some("dev/pods/web"));
    }

    #[tokio::test]
    async fn event_does_not_touch_other_namespaces_or_cluster_names() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store.insert_permission(&sample_row("other-ns")).await.unwrap();
        store
            .insert_permission(&sample_row("cluster-wide/web"))
            .await
            .unwrap();

        store
            .apply_usage_batch(&[usage("dev/web", "2024-03-01 12:00:00")])
            .await
            .unwrap();

        for row in store.rows_for_entity("alice").await.unwrap() {
            assert!(row.last_used_time.is_none(), "scope {} was touched", row.permission_scope);
        }
    }

    #[tokio::test]
    async fn last_used_time_is_monotonic() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store.insert_permission(&sample_row("dev")).await.unwrap();

        store
            .apply_usage_batch(&[usage("dev", "2024-03-02 00:00:00")])
            .await
            .unwrap();
        // An older event must not move the timestamp backwards.
        store
            .apply_usage_batch(&[usage("dev", "2024-03-01 00:00:00")])
            .await
            .unwrap();

        let rows = store.rows_for_entity("alice").await.unwrap();
        assert_eq!(
            rows[0].last_used_time.as_deref(),
            Some("2024-03-02 00:00:00")
        );

        // A newer one advances it.
        store
            .apply_usage_batch(&[usage("dev", "2024-03-03 00:00:00")])
            .await
            .unwrap();
        let rows = store.rows_for_entity("alice").await.unwrap();
        assert_eq!(
            rows[0].last_used_time.as_deref(),
            Some("2024-03-03 00:00:00")
        );
    }

    #[tokio::test]
    async fn namespaced_inference_uses_scope_first_segment() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store.insert_permission(&sample_row("dev")).await.unwrap();

        let mut cluster_row = sample_row("cluster-wide");
        cluster_row.resource_type = "nodes".into();
        store.insert_permission(&cluster_row).await.unwrap();

        let namespaces: HashSet<String> = ["dev".to_string()].into_iter().collect();
        assert!(store
            .is_resource_namespaced("pods", &namespaces)
            .await
            .unwrap());
        assert!(!store
            .is_resource_namespaced("nodes", &namespaces)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn workload_upsert_refreshes_identity() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        let mut w = WorkloadIdentity {
            workload_type: "Deployment".into(),
            workload_name: "web".into(),
            service_account_name: "dev:app".into(),
            workload_identity: String::new(),
            original_owner_type: "deployment".into(),
            original_owner_name: "web".into(),
        };
        store.upsert_workload(&w).await.unwrap();
        w.workload_identity = "arn:aws:iam::1:role/web".into();
        store.upsert_workload(&w).await.unwrap();

        assert_eq!(store.workload_count().await.unwrap(), 1);
        let row = sqlx::query("SELECT workload_identity FROM workload_identities")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let identity: String = row.get(0);
        assert_eq!(identity, "arn:aws:iam::1:role/web");
    }
}
