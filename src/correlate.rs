/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/correlate.rs
 *
 * The usage correlator. Streams the spill file line by line (never the
 * whole file), projects each record onto the canonical audit event, and
 * accumulates last-used updates that are applied in batched transactions.
 * When the in-memory buffer crosses the flush threshold it is written out
 * mid-stream so the working set stays bounded on large ingests.
 *
 * The first event observed for a principal seeds a per-run cache of its
 * groups and copies every permission row owned by those groups onto the
 * principal (group inheritance); later events for the same principal skip
 * the step entirely.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use std::collections::HashMap;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::error::Result;
use crate::ingest::progress::Progress;
use crate::normalize::{
    compose_api_group, compose_resource_type, entity_name_and_type, last_used_resource,
    permission_scope, AuditEvent,
};
use crate::policies::AccessPolicyExpander;
use crate::store::{PermissionStore, UpdateData};

/// Buffer size that triggers a mid-stream flush.
const FLUSH_THRESHOLD: usize = 5_000;

const EKS_POLICY_REASON_PREFIX: &str = "EKS Access Policy";

pub type LineParser = fn(&str) -> Option<AuditEvent>;

pub struct Correlator<'a> {
    store: &'a PermissionStore,
    progress: &'a Progress,
    /// Principal -> groups, seeded on first observation.
    seen_principals: HashMap<String, Vec<String>>,
    buffer: Vec<UpdateData>,
}

impl<'a> Correlator<'a> {
    pub fn new(store: &'a PermissionStore, progress: &'a Progress) -> Self {
        Self {
            store,
            progress,
            seen_principals: HashMap::new(),
            buffer: Vec::new(),
        }
    }

    /// Consumes the spill file. `expander` is present only on EKS runs,
    /// where audit events can reference cloud-managed access policies.
    pub async fn process_spill(
        &mut self,
        path: &Path,
        parser: LineParser,
        mut expander: Option<&mut AccessPolicyExpander>,
    ) -> Result<()> {
        info!(spill = %path.display(), "processing logs and updating the permission table");
        self.progress.start("cluster events processed");

        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut line_number: u64 = 0;

        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            self.progress.add(1);

            let Some(event) = parser(&line) else {
                warn!(line = line_number, "skipping malformed or filtered log record");
                continue;
            };
            if event.timestamp.is_empty() {
                warn!(line = line_number, "skipping record without a usable timestamp");
                continue;
            }

            if let Some(expander) = expander.as_deref_mut() {
                if event.authorization_reason.starts_with(EKS_POLICY_REASON_PREFIX) {
                    if let Err(e) = expander.handle_event(&event).await {
                        warn!(error = %e, "access-policy expansion failed for event");
                    }
                }
            }

            self.observe(event).await?;
        }

        self.flush().await?;
        self.progress.stop();
        Ok(())
    }

    async fn observe(&mut self, event: AuditEvent) -> Result<()> {
        let (entity_name, entity_type) = entity_name_and_type(&event.username);

        if !self.seen_principals.contains_key(&entity_name) {
            self.seen_principals
                .insert(entity_name.clone(), event.groups.clone());
            self.inherit_group_permissions(&entity_name, &entity_type, &event.groups)
                .await?;
        }

        let resource_type = compose_resource_type(&event.resource, &event.subresource);
        self.buffer.push(UpdateData {
            entity_name,
            entity_type,
            api_group: compose_api_group(&event.api_group, &event.api_version),
            resource_type: resource_type.clone(),
            verb: event.verb,
            permission_scope: permission_scope(&event.namespace, &event.name),
            last_used_time: event.timestamp,
            last_used_resource: last_used_resource(&event.namespace, &resource_type, &event.name),
        });

        if self.buffer.len() > FLUSH_THRESHOLD {
            self.flush().await?;
        }
        Ok(())
    }

    /// Copies every row owned by each asserted group onto the principal.
    /// Duplicates die at the unique index.
    async fn inherit_group_permissions(
        &self,
        entity_name: &str,
        entity_type: &str,
        groups: &[String],
    ) -> Result<()> {
        for group in groups {
            let rows = self.store.rows_for_entity(group).await?;
            for mut row in rows {
                row.entity_name = entity_name.to_string();
                row.entity_type = entity_type.to_string();
                row.permission_source = group.clone();
                row.permission_source_type = "Group".to_string();
                self.store.insert_permission(&row).await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.store.apply_usage_batch(&self.buffer).await?;
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::providers::parse_local_line;
    use crate::store::PermissionRow;
    use std::io::Write;

    fn group_row(verb: &str) -> PermissionRow {
        PermissionRow {
            entity_name: "system:masters".into(),
            entity_type: "Group".into(),
            api_group: "v1".into(),
            resource_type: "pods".into(),
            verb: verb.into(),
            permission_scope: "dev".into(),
            permission_source: "cluster-admin".into(),
            permission_source_type: "ClusterRole".into(),
            permission_binding: "cluster-admin-binding".into(),
            permission_binding_type: "ClusterRoleBinding".into(),
            last_used_time: None,
            last_used_resource: None,
        }
    }

    fn audit_line(username: &str, groups: &[&str], verb: &str, ts: &str) -> String {
        serde_json::json!({
            "verb": verb,
            "stage": "ResponseComplete",
            "responseStatus": {"code": 200},
            "user": {"username": username, "groups": groups},
            "objectRef": {
                "resource": "pods",
                "namespace": "dev",
                "name": "web",
                "apiVersion": "v1",
            },
            "requestReceivedTimestamp": ts,
        })
        .to_string()
    }

    async fn run_spill(store: &PermissionStore, lines: &[String]) {
        let mut spill = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(spill, "{}", line).unwrap();
        }
        spill.flush().unwrap();

        let progress = Progress::new();
        let mut correlator = Correlator::new(store, &progress);
        correlator
            .process_spill(spill.path(), parse_local_line, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn group_permissions_are_inherited_on_first_observation_only() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store.insert_permission(&group_row("get")).await.unwrap();
        store.insert_permission(&group_row("list")).await.unwrap();

        run_spill(
            &store,
            &[
                audit_line("bob", &["system:masters"], "get", "2024-03-01T10:00:00Z"),
                audit_line("bob", &["system:masters"], "list", "2024-03-01T11:00:00Z"),
            ],
        )
        .await;

        let rows = store.rows_for_entity("bob").await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.entity_type, "User");
            assert_eq!(row.permission_source, "system:masters");
            assert_eq!(row.permission_source_type, "Group");
        }

        // A second pass over the same principal must not duplicate rows.
        run_spill(
            &store,
            &[audit_line("bob", &["system:masters"], "get", "2024-03-02T10:00:00Z")],
        )
        .await;
        assert_eq!(store.rows_for_entity("bob").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn observed_usage_lands_on_the_inherited_rows() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store.insert_permission(&group_row("get")).await.unwrap();

        run_spill(
            &store,
            &[audit_line("bob", &["system:masters"], "get", "2024-03-01T10:00:00Z")],
        )
        .await;

        let rows = store.rows_for_entity("bob").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].last_used_time.as_deref(),
            Some("2024-03-01 10:00:00")
        );
        assert_eq!(
            rows[0].last_used_resource.as_deref(),
            Some("dev/pods/web")
        );
    }

    #[tokio::test]
    async fn malformed_lines_do_not_abort_the_run() {
        let store = PermissionStore::open_in_memory().await.unwrap();
        store.insert_permission(&group_row("get")).await.unwrap();

        run_spill(
            &store,
            &[
                "{broken json".to_string(),
                audit_line("bob", &["system:masters"], "get", "2024-03-01T10:00:00Z"),
            ],
        )
        .await;

        assert_eq!(store.rows_for_entity("bob").await.unwrap().len(), 1);
    }
}
