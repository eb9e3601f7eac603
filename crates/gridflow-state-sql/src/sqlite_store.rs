// Copyright 2025 DataStax Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use chrono::{DateTime, Utc};
use error_stack::{Result, ResultExt as _};
use futures::future::{BoxFuture, FutureExt as _};
use gridflow_core::{
    Bookmark, BookmarkId, BookmarkKind, EventBody, EventId, MarketRole, OperationContext,
    SequenceNumber, StepId, TemplateId, Tenant, TenantId, TenantScope, TenantStatus, UserId,
    ValueRef, WorkflowEvent, WorkflowId, WorkflowInstance, WorkflowStatus, WorkflowTemplate,
};
use gridflow_state::{
    BookmarkStore, EventRange, EventStore, IndexRow, IndexStore, Page, StateError, StateStore,
    TemplateStore, TenantStore, WorkflowFilter,
};
use sqlx::{Row as _, SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::Arc;
use uuid::Uuid;

use crate::migrations;

/// Parse a datetime string from SQLite.
///
/// Columns written by this store are RFC3339, but CURRENT_TIMESTAMP values
/// ("YYYY-MM-DD HH:MM:SS") are accepted for compatibility.
fn parse_sqlite_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }

    None
}

fn get_datetime(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>, StateError> {
    let raw: String = row.try_get(column).change_context(StateError::Internal)?;
    parse_sqlite_datetime(&raw)
        .ok_or_else(|| error_stack::report!(StateError::Serialization))
        .attach_printable_lazy(|| format!("unparseable datetime in column '{column}': {raw}"))
}

fn get_uuid(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Uuid, StateError> {
    let raw: String = row.try_get(column).change_context(StateError::Internal)?;
    Uuid::parse_str(&raw)
        .change_context(StateError::Serialization)
        .attach_printable_lazy(|| format!("unparseable uuid in column '{column}'"))
}

/// Configuration for [`SqliteWorkflowStore`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqliteConfig {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_auto_migrate")]
    pub auto_migrate: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_auto_migrate() -> bool {
    true
}

/// SQLite-backed implementation of every store contract.
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub async fn new(config: SqliteConfig) -> Result<Self, StateError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .change_context(StateError::Connection)
            .attach_printable_lazy(|| format!("Database URL: {}", config.database_url))?;

        if config.auto_migrate {
            migrations::run_migrations(&pool).await?;
        }

        Ok(Self { pool })
    }

    pub async fn from_url(database_url: &str) -> Result<Self, StateError> {
        Self::new(SqliteConfig {
            database_url: database_url.to_string(),
            max_connections: default_max_connections(),
            auto_migrate: default_auto_migrate(),
        })
        .await
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowEvent, StateError> {
        let body_json: String = row.try_get("body").change_context(StateError::Internal)?;
        let body: EventBody =
            serde_json::from_str(&body_json).change_context(StateError::Serialization)?;
        let sequence_no: i64 = row
            .try_get("sequence_no")
            .change_context(StateError::Internal)?;

        Ok(WorkflowEvent {
            event_id: EventId::from_uuid(get_uuid(row, "event_id")?),
            workflow_id: WorkflowId::from_uuid(get_uuid(row, "workflow_id")?),
            tenant_id: TenantId::from_uuid(get_uuid(row, "tenant_id")?),
            sequence_no: SequenceNumber::new(sequence_no as u64),
            performed_by: UserId::from_uuid(get_uuid(row, "performed_by")?),
            occurred_at: get_datetime(row, "occurred_at")?,
            body,
        })
    }

    fn row_to_index(row: &sqlx::sqlite::SqliteRow) -> Result<IndexRow, StateError> {
        let status_raw: String = row.try_get("status").change_context(StateError::Internal)?;
        let status: WorkflowStatus = status_raw
            .parse()
            .map_err(|_| error_stack::report!(StateError::Serialization))?;
        let role_raw: String = row
            .try_get("market_role")
            .change_context(StateError::Internal)?;
        let market_role: MarketRole = role_raw
            .parse()
            .map_err(|_| error_stack::report!(StateError::Serialization))?;
        let current_step_id: Option<String> = row
            .try_get("current_step_id")
            .change_context(StateError::Internal)?;

        Ok(IndexRow {
            id: WorkflowId::from_uuid(get_uuid(row, "id")?),
            tenant_id: TenantId::from_uuid(get_uuid(row, "tenant_id")?),
            template_id: TemplateId::from_uuid(get_uuid(row, "template_id")?),
            market_role,
            status,
            current_step_id: current_step_id.map(StepId::from),
            created_at: get_datetime(row, "created_at")?,
            updated_at: get_datetime(row, "updated_at")?,
        })
    }

    fn row_to_bookmark(row: &sqlx::sqlite::SqliteRow) -> Result<Bookmark, StateError> {
        let kind_raw: String = row.try_get("kind").change_context(StateError::Internal)?;
        let kind: BookmarkKind = kind_raw
            .parse()
            .map_err(|_| error_stack::report!(StateError::Serialization))?;
        let step_id: String = row.try_get("step_id").change_context(StateError::Internal)?;
        let shape_json: String = row
            .try_get("payload_shape")
            .change_context(StateError::Internal)?;
        let expected_payload_shape: ValueRef =
            serde_json::from_str(&shape_json).change_context(StateError::Serialization)?;
        let expires_at: Option<String> = row
            .try_get("expires_at")
            .change_context(StateError::Internal)?;
        let consumed_at: Option<String> = row
            .try_get("consumed_at")
            .change_context(StateError::Internal)?;

        Ok(Bookmark {
            bookmark_id: BookmarkId::from_uuid(get_uuid(row, "bookmark_id")?),
            workflow_id: WorkflowId::from_uuid(get_uuid(row, "workflow_id")?),
            tenant_id: TenantId::from_uuid(get_uuid(row, "tenant_id")?),
            step_id: StepId::from(step_id),
            kind,
            expected_payload_shape,
            created_at: get_datetime(row, "created_at")?,
            expires_at: expires_at.as_deref().and_then(parse_sqlite_datetime),
            consumed_at: consumed_at.as_deref().and_then(parse_sqlite_datetime),
        })
    }

    fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowInstance, StateError> {
        let document: String = row
            .try_get("document")
            .change_context(StateError::Internal)?;
        serde_json::from_str(&document).change_context(StateError::Serialization)
    }
}

impl EventStore for SqliteWorkflowStore {
    fn append(
        &self,
        event: WorkflowEvent,
    ) -> BoxFuture<'_, Result<SequenceNumber, StateError>> {
        async move { append_batch(&self.pool, vec![event]).await }.boxed()
    }

    fn append_many(
        &self,
        events: Vec<WorkflowEvent>,
    ) -> BoxFuture<'_, Result<SequenceNumber, StateError>> {
        async move { append_batch(&self.pool, events).await }.boxed()
    }

    fn get_events(
        &self,
        workflow_id: WorkflowId,
        range: EventRange,
    ) -> BoxFuture<'_, Result<Vec<WorkflowEvent>, StateError>> {
        async move {
            let rows = sqlx::query(
                "SELECT workflow_id, sequence_no, event_id, tenant_id, performed_by, occurred_at, body \
                 FROM workflow_events WHERE workflow_id = ? ORDER BY sequence_no",
            )
            .bind(workflow_id.as_uuid().to_string())
            .fetch_all(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            let mut events = Vec::with_capacity(rows.len());
            for row in &rows {
                let event = Self::row_to_event(row)?;
                if range.contains(event.sequence_no, event.occurred_at) {
                    events.push(event);
                }
            }
            Ok(events)
        }
        .boxed()
    }

    fn get_events_by_tenant(
        &self,
        tenant_id: TenantId,
        from_time: DateTime<Utc>,
        to_time: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<WorkflowEvent>, StateError>> {
        async move {
            let rows = sqlx::query(
                "SELECT workflow_id, sequence_no, event_id, tenant_id, performed_by, occurred_at, body \
                 FROM workflow_events WHERE tenant_id = ? AND occurred_at >= ? AND occurred_at <= ? \
                 ORDER BY occurred_at, sequence_no LIMIT ?",
            )
            .bind(tenant_id.as_uuid().to_string())
            .bind(from_time.to_rfc3339())
            .bind(to_time.to_rfc3339())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            rows.iter().map(Self::row_to_event).collect()
        }
        .boxed()
    }

    fn latest_sequence(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, Result<Option<SequenceNumber>, StateError>> {
        async move {
            let row = sqlx::query(
                "SELECT MAX(sequence_no) as latest FROM workflow_events WHERE workflow_id = ?",
            )
            .bind(workflow_id.as_uuid().to_string())
            .fetch_one(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            let latest: Option<i64> = row.try_get("latest").change_context(StateError::Internal)?;
            Ok(latest.map(|l| SequenceNumber::new(l as u64)))
        }
        .boxed()
    }
}

/// Append a contiguous batch inside one transaction.
///
/// The density check runs against the committed maximum under the
/// transaction, so either the whole batch lands at the expected sequences or
/// nothing is written.
async fn append_batch(
    pool: &SqlitePool,
    events: Vec<WorkflowEvent>,
) -> Result<SequenceNumber, StateError> {
    let Some(first) = events.first() else {
        return Err(error_stack::report!(StateError::Internal))
            .attach_printable("append called with an empty batch");
    };
    let workflow_id = first.workflow_id;
    if events.iter().any(|e| e.workflow_id != workflow_id) {
        return Err(error_stack::report!(StateError::Internal))
            .attach_printable("append batch spans multiple workflows");
    }

    let mut tx = pool.begin().await.change_context(StateError::Connection)?;

    let row = sqlx::query(
        "SELECT MAX(sequence_no) as latest FROM workflow_events WHERE workflow_id = ?",
    )
    .bind(workflow_id.as_uuid().to_string())
    .fetch_one(&mut *tx)
    .await
    .change_context(StateError::Internal)?;
    let latest: Option<i64> = row.try_get("latest").change_context(StateError::Internal)?;
    let mut expected = latest.unwrap_or(0) as u64 + 1;

    let mut last = SequenceNumber::default();
    for event in &events {
        let got = event.sequence_no.value();
        if got != expected {
            return if got < expected {
                Err(error_stack::report!(StateError::ConflictingWrite {
                    workflow_id,
                }))
            } else {
                Err(error_stack::report!(StateError::NonDenseSequence {
                    workflow_id,
                    expected,
                    got,
                }))
            };
        }

        let body = serde_json::to_string(&event.body).change_context(StateError::Serialization)?;
        sqlx::query(
            "INSERT INTO workflow_events \
             (workflow_id, sequence_no, event_id, tenant_id, performed_by, occurred_at, body) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.workflow_id.as_uuid().to_string())
        .bind(got as i64)
        .bind(event.event_id.as_uuid().to_string())
        .bind(event.tenant_id.as_uuid().to_string())
        .bind(event.performed_by.as_uuid().to_string())
        .bind(event.occurred_at.to_rfc3339())
        .bind(body)
        .execute(&mut *tx)
        .await
        .change_context(StateError::Internal)?;

        last = event.sequence_no;
        expected += 1;
    }

    tx.commit().await.change_context(StateError::Connection)?;
    Ok(last)
}

impl StateStore for SqliteWorkflowStore {
    fn get(
        &self,
        ctx: &OperationContext,
        id: WorkflowId,
    ) -> BoxFuture<'_, Result<Option<WorkflowInstance>, StateError>> {
        let scope = ctx.scope();
        async move {
            let row = match scope {
                TenantScope::All => {
                    sqlx::query("SELECT document FROM workflow_instances WHERE id = ?")
                        .bind(id.as_uuid().to_string())
                        .fetch_optional(&self.pool)
                        .await
                }
                TenantScope::One(tenant_id) => sqlx::query(
                    "SELECT document FROM workflow_instances WHERE id = ? AND tenant_id = ?",
                )
                .bind(id.as_uuid().to_string())
                .bind(tenant_id.as_uuid().to_string())
                .fetch_optional(&self.pool)
                .await,
            }
            .change_context(StateError::Internal)?;

            row.as_ref().map(Self::row_to_instance).transpose()
        }
        .boxed()
    }

    fn insert(&self, instance: WorkflowInstance) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            let document =
                serde_json::to_string(&instance).change_context(StateError::Serialization)?;
            sqlx::query(
                "INSERT OR REPLACE INTO workflow_instances \
                 (id, tenant_id, status, version, document, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(instance.id.as_uuid().to_string())
            .bind(instance.tenant_id.as_uuid().to_string())
            .bind(instance.status.as_str())
            .bind(instance.version as i64)
            .bind(document)
            .bind(instance.created_at.to_rfc3339())
            .bind(instance.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;
            Ok(())
        }
        .boxed()
    }

    fn update(
        &self,
        instance: WorkflowInstance,
        expected_version: u64,
    ) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            let mut instance = instance;
            instance.version = expected_version + 1;
            let document =
                serde_json::to_string(&instance).change_context(StateError::Serialization)?;

            let result = sqlx::query(
                "UPDATE workflow_instances SET status = ?, version = ?, document = ?, updated_at = ? \
                 WHERE id = ? AND version = ?",
            )
            .bind(instance.status.as_str())
            .bind(instance.version as i64)
            .bind(document)
            .bind(instance.updated_at.to_rfc3339())
            .bind(instance.id.as_uuid().to_string())
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            if result.rows_affected() == 1 {
                return Ok(());
            }

            // Distinguish a missing row from a lost race.
            let row = sqlx::query("SELECT version FROM workflow_instances WHERE id = ?")
                .bind(instance.id.as_uuid().to_string())
                .fetch_optional(&self.pool)
                .await
                .change_context(StateError::Internal)?;
            match row {
                None => Err(error_stack::report!(StateError::WorkflowNotFound {
                    workflow_id: instance.id,
                })),
                Some(row) => {
                    let found: i64 = row.try_get("version").change_context(StateError::Internal)?;
                    Err(error_stack::report!(StateError::StaleWrite {
                        workflow_id: instance.id,
                        expected: expected_version,
                        found: found as u64,
                    }))
                }
            }
        }
        .boxed()
    }

    fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
    ) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            let result = sqlx::query(
                "UPDATE workflow_instances SET status = ?, updated_at = ? WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_uuid().to_string())
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            if result.rows_affected() == 0 {
                return Err(error_stack::report!(StateError::WorkflowNotFound {
                    workflow_id: id,
                }));
            }
            Ok(())
        }
        .boxed()
    }

    fn find(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
    ) -> BoxFuture<'_, Result<Vec<WorkflowInstance>, StateError>> {
        let scope = ctx.scope();
        async move {
            let rows = match scope {
                TenantScope::All => {
                    sqlx::query("SELECT document FROM workflow_instances ORDER BY created_at")
                        .fetch_all(&self.pool)
                        .await
                }
                TenantScope::One(tenant_id) => sqlx::query(
                    "SELECT document FROM workflow_instances WHERE tenant_id = ? ORDER BY created_at",
                )
                .bind(tenant_id.as_uuid().to_string())
                .fetch_all(&self.pool)
                .await,
            }
            .change_context(StateError::Internal)?;

            let mut instances = Vec::new();
            for row in &rows {
                let instance = Self::row_to_instance(row)?;
                if filter.matches(&IndexRow::from_instance(&instance)) {
                    instances.push(instance);
                }
            }
            Ok(instances)
        }
        .boxed()
    }

    fn delete(&self, id: WorkflowId) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            sqlx::query("DELETE FROM workflow_instances WHERE id = ?")
                .bind(id.as_uuid().to_string())
                .execute(&self.pool)
                .await
                .change_context(StateError::Internal)?;
            Ok(())
        }
        .boxed()
    }
}

impl IndexStore for SqliteWorkflowStore {
    fn insert(&self, row: IndexRow) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            sqlx::query(
                "INSERT OR REPLACE INTO workflow_index \
                 (id, tenant_id, template_id, market_role, status, current_step_id, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.id.as_uuid().to_string())
            .bind(row.tenant_id.as_uuid().to_string())
            .bind(row.template_id.as_uuid().to_string())
            .bind(row.market_role.as_str())
            .bind(row.status.as_str())
            .bind(row.current_step_id.as_ref().map(|s| s.as_str().to_string()))
            .bind(row.created_at.to_rfc3339())
            .bind(row.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;
            Ok(())
        }
        .boxed()
    }

    fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        current_step_id: Option<StepId>,
    ) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            // Idempotent under the same (status, current_step_id): the WHERE
            // clause skips the write, leaving updated_at untouched.
            let result = sqlx::query(
                "UPDATE workflow_index SET status = ?, current_step_id = ?, updated_at = ? \
                 WHERE id = ? AND (status != ? OR current_step_id IS NOT ?)",
            )
            .bind(status.as_str())
            .bind(current_step_id.as_ref().map(|s| s.as_str().to_string()))
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_uuid().to_string())
            .bind(status.as_str())
            .bind(current_step_id.as_ref().map(|s| s.as_str().to_string()))
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            if result.rows_affected() == 0 {
                // Either already at the requested pair, or missing entirely.
                let row = sqlx::query("SELECT COUNT(*) as count FROM workflow_index WHERE id = ?")
                    .bind(id.as_uuid().to_string())
                    .fetch_one(&self.pool)
                    .await
                    .change_context(StateError::Internal)?;
                let count: i64 = row.try_get("count").change_context(StateError::Internal)?;
                if count == 0 {
                    return Err(error_stack::report!(StateError::WorkflowNotFound {
                        workflow_id: id,
                    }));
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn get(
        &self,
        ctx: &OperationContext,
        id: WorkflowId,
    ) -> BoxFuture<'_, Result<Option<IndexRow>, StateError>> {
        let scope = ctx.scope();
        async move {
            let row = match scope {
                TenantScope::All => sqlx::query("SELECT * FROM workflow_index WHERE id = ?")
                    .bind(id.as_uuid().to_string())
                    .fetch_optional(&self.pool)
                    .await,
                TenantScope::One(tenant_id) => {
                    sqlx::query("SELECT * FROM workflow_index WHERE id = ? AND tenant_id = ?")
                        .bind(id.as_uuid().to_string())
                        .bind(tenant_id.as_uuid().to_string())
                        .fetch_optional(&self.pool)
                        .await
                }
            }
            .change_context(StateError::Internal)?;

            row.as_ref().map(Self::row_to_index).transpose()
        }
        .boxed()
    }

    fn query(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
        page: Page,
    ) -> BoxFuture<'_, Result<Vec<IndexRow>, StateError>> {
        let scope = ctx.scope();
        async move {
            let rows = scoped_index_rows(&self.pool, scope).await?;
            let mut matched = Vec::new();
            for row in &rows {
                let index_row = Self::row_to_index(row)?;
                if filter.matches(&index_row) {
                    matched.push(index_row);
                }
            }
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(matched
                .into_iter()
                .skip(page.offset)
                .take(page.limit)
                .collect())
        }
        .boxed()
    }

    fn count(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
    ) -> BoxFuture<'_, Result<u64, StateError>> {
        let scope = ctx.scope();
        async move {
            let rows = scoped_index_rows(&self.pool, scope).await?;
            let mut count = 0u64;
            for row in &rows {
                if filter.matches(&Self::row_to_index(row)?) {
                    count += 1;
                }
            }
            Ok(count)
        }
        .boxed()
    }

    fn delete(&self, id: WorkflowId) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            sqlx::query("DELETE FROM workflow_index WHERE id = ?")
                .bind(id.as_uuid().to_string())
                .execute(&self.pool)
                .await
                .change_context(StateError::Internal)?;
            Ok(())
        }
        .boxed()
    }
}

async fn scoped_index_rows(
    pool: &SqlitePool,
    scope: TenantScope,
) -> Result<Vec<sqlx::sqlite::SqliteRow>, StateError> {
    match scope {
        TenantScope::All => {
            sqlx::query("SELECT * FROM workflow_index")
                .fetch_all(pool)
                .await
        }
        TenantScope::One(tenant_id) => {
            sqlx::query("SELECT * FROM workflow_index WHERE tenant_id = ?")
                .bind(tenant_id.as_uuid().to_string())
                .fetch_all(pool)
                .await
        }
    }
    .change_context(StateError::Internal)
}

impl BookmarkStore for SqliteWorkflowStore {
    fn put(&self, bookmark: Bookmark) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            let row = sqlx::query(
                "SELECT COUNT(*) as count FROM workflow_bookmarks \
                 WHERE workflow_id = ? AND step_id = ? AND consumed_at IS NULL",
            )
            .bind(bookmark.workflow_id.as_uuid().to_string())
            .bind(bookmark.step_id.as_str())
            .fetch_one(&self.pool)
            .await
            .change_context(StateError::Internal)?;
            let count: i64 = row.try_get("count").change_context(StateError::Internal)?;
            if count > 0 {
                return Err(error_stack::report!(StateError::ActiveBookmarkExists {
                    workflow_id: bookmark.workflow_id,
                    step_id: bookmark.step_id.clone(),
                }));
            }

            let shape = serde_json::to_string(&bookmark.expected_payload_shape)
                .change_context(StateError::Serialization)?;
            sqlx::query(
                "INSERT INTO workflow_bookmarks \
                 (bookmark_id, workflow_id, tenant_id, step_id, kind, payload_shape, created_at, expires_at, consumed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)",
            )
            .bind(bookmark.bookmark_id.as_uuid().to_string())
            .bind(bookmark.workflow_id.as_uuid().to_string())
            .bind(bookmark.tenant_id.as_uuid().to_string())
            .bind(bookmark.step_id.as_str())
            .bind(bookmark.kind.as_str())
            .bind(shape)
            .bind(bookmark.created_at.to_rfc3339())
            .bind(bookmark.expires_at.map(|t| t.to_rfc3339()))
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;
            Ok(())
        }
        .boxed()
    }

    fn get(
        &self,
        bookmark_id: BookmarkId,
    ) -> BoxFuture<'_, Result<Option<Bookmark>, StateError>> {
        async move {
            let row = sqlx::query("SELECT * FROM workflow_bookmarks WHERE bookmark_id = ?")
                .bind(bookmark_id.as_uuid().to_string())
                .fetch_optional(&self.pool)
                .await
                .change_context(StateError::Internal)?;
            row.as_ref().map(Self::row_to_bookmark).transpose()
        }
        .boxed()
    }

    fn consume(
        &self,
        bookmark_id: BookmarkId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Bookmark, StateError>> {
        async move {
            // Compare-and-set on consumed_at: exactly one consumer wins.
            let result = sqlx::query(
                "UPDATE workflow_bookmarks SET consumed_at = ? \
                 WHERE bookmark_id = ? AND consumed_at IS NULL",
            )
            .bind(at.to_rfc3339())
            .bind(bookmark_id.as_uuid().to_string())
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            if result.rows_affected() == 0 {
                let existing = BookmarkStore::get(self, bookmark_id).await?;
                return match existing {
                    None => Err(error_stack::report!(StateError::BookmarkNotFound {
                        bookmark_id,
                    })),
                    Some(_) => Err(error_stack::report!(StateError::BookmarkAlreadyConsumed {
                        bookmark_id,
                    })),
                };
            }

            BookmarkStore::get(self, bookmark_id)
                .await?
                .ok_or_else(|| error_stack::report!(StateError::BookmarkNotFound { bookmark_id }))
        }
        .boxed()
    }

    fn find_active(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, Result<Vec<Bookmark>, StateError>> {
        async move {
            let rows = sqlx::query(
                "SELECT * FROM workflow_bookmarks \
                 WHERE workflow_id = ? AND consumed_at IS NULL ORDER BY created_at",
            )
            .bind(workflow_id.as_uuid().to_string())
            .fetch_all(&self.pool)
            .await
            .change_context(StateError::Internal)?;
            rows.iter().map(Self::row_to_bookmark).collect()
        }
        .boxed()
    }

    fn find_expired(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Bookmark>, StateError>> {
        async move {
            let rows = sqlx::query(
                "SELECT * FROM workflow_bookmarks \
                 WHERE consumed_at IS NULL AND expires_at IS NOT NULL AND expires_at < ?",
            )
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .change_context(StateError::Internal)?;
            rows.iter().map(Self::row_to_bookmark).collect()
        }
        .boxed()
    }

    fn delete_for_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            sqlx::query("DELETE FROM workflow_bookmarks WHERE workflow_id = ?")
                .bind(workflow_id.as_uuid().to_string())
                .execute(&self.pool)
                .await
                .change_context(StateError::Internal)?;
            Ok(())
        }
        .boxed()
    }
}

impl TemplateStore for SqliteWorkflowStore {
    fn put(&self, template: WorkflowTemplate) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            let document =
                serde_json::to_string(&template).change_context(StateError::Serialization)?;
            let result = sqlx::query(
                "INSERT OR IGNORE INTO workflow_templates \
                 (market_role, version, template_id, document, published_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(template.market_role.as_str())
            .bind(template.version as i64)
            .bind(template.id.as_uuid().to_string())
            .bind(document)
            .bind(template.published_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            if result.rows_affected() == 0 {
                return Err(error_stack::report!(StateError::DuplicateTemplate {
                    market_role: template.market_role,
                    version: template.version,
                }));
            }
            Ok(())
        }
        .boxed()
    }

    fn get(
        &self,
        market_role: MarketRole,
        version: u32,
    ) -> BoxFuture<'_, Result<Option<Arc<WorkflowTemplate>>, StateError>> {
        async move {
            let row = sqlx::query(
                "SELECT document FROM workflow_templates WHERE market_role = ? AND version = ?",
            )
            .bind(market_role.as_str())
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            row.map(|row| template_from_row(&row)).transpose()
        }
        .boxed()
    }

    fn get_by_id(
        &self,
        template_id: TemplateId,
    ) -> BoxFuture<'_, Result<Option<Arc<WorkflowTemplate>>, StateError>> {
        async move {
            let row = sqlx::query("SELECT document FROM workflow_templates WHERE template_id = ?")
                .bind(template_id.as_uuid().to_string())
                .fetch_optional(&self.pool)
                .await
                .change_context(StateError::Internal)?;

            row.map(|row| template_from_row(&row)).transpose()
        }
        .boxed()
    }

    fn latest(
        &self,
        market_role: MarketRole,
    ) -> BoxFuture<'_, Result<Option<Arc<WorkflowTemplate>>, StateError>> {
        async move {
            let row = sqlx::query(
                "SELECT document FROM workflow_templates WHERE market_role = ? \
                 ORDER BY version DESC LIMIT 1",
            )
            .bind(market_role.as_str())
            .fetch_optional(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            row.map(|row| template_from_row(&row)).transpose()
        }
        .boxed()
    }

    fn list(
        &self,
        market_role: MarketRole,
    ) -> BoxFuture<'_, Result<Vec<Arc<WorkflowTemplate>>, StateError>> {
        async move {
            let rows = sqlx::query(
                "SELECT document FROM workflow_templates WHERE market_role = ? ORDER BY version",
            )
            .bind(market_role.as_str())
            .fetch_all(&self.pool)
            .await
            .change_context(StateError::Internal)?;

            rows.iter().map(template_from_row).collect()
        }
        .boxed()
    }
}

impl TenantStore for SqliteWorkflowStore {
    fn put(&self, tenant: Tenant) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            sqlx::query(
                "INSERT OR REPLACE INTO tenants (id, name, status, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(tenant.id.as_uuid().to_string())
            .bind(&tenant.name)
            .bind(tenant.status.as_str())
            .bind(tenant.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StateError::Internal)?;
            Ok(())
        }
        .boxed()
    }

    fn get(&self, tenant_id: TenantId) -> BoxFuture<'_, Result<Option<Tenant>, StateError>> {
        async move {
            let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
                .bind(tenant_id.as_uuid().to_string())
                .fetch_optional(&self.pool)
                .await
                .change_context(StateError::Internal)?;

            row.map(|row| {
                let name: String = row.try_get("name").change_context(StateError::Internal)?;
                let status_raw: String =
                    row.try_get("status").change_context(StateError::Internal)?;
                let status: TenantStatus = status_raw
                    .parse()
                    .map_err(|_| error_stack::report!(StateError::Serialization))?;
                Ok(Tenant {
                    id: TenantId::from_uuid(get_uuid(&row, "id")?),
                    name,
                    status,
                    created_at: get_datetime(&row, "created_at")?,
                })
            })
            .transpose()
        }
        .boxed()
    }

    fn set_status(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
    ) -> BoxFuture<'_, Result<(), StateError>> {
        async move {
            let result = sqlx::query("UPDATE tenants SET status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(tenant_id.as_uuid().to_string())
                .execute(&self.pool)
                .await
                .change_context(StateError::Internal)?;

            if result.rows_affected() == 0 {
                return Err(error_stack::report!(StateError::TenantNotFound { tenant_id }));
            }
            Ok(())
        }
        .boxed()
    }
}

fn template_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Arc<WorkflowTemplate>, StateError> {
    let document: String = row
        .try_get("document")
        .change_context(StateError::Internal)?;
    let template: WorkflowTemplate =
        serde_json::from_str(&document).change_context(StateError::Serialization)?;
    Ok(Arc::new(template))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Actor, EventBody, StepKind, WorkflowTemplateBuilder};

    async fn store() -> SqliteWorkflowStore {
        // A single connection keeps the in-memory database shared across
        // all statements in the test.
        SqliteWorkflowStore::new(SqliteConfig {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            auto_migrate: true,
        })
        .await
        .unwrap()
    }

    fn event(workflow_id: WorkflowId, tenant_id: TenantId, seq: u64) -> WorkflowEvent {
        WorkflowEvent::new(
            workflow_id,
            tenant_id,
            SequenceNumber::new(seq),
            UserId::new(),
            EventBody::DataUpdated {
                step_id: StepId::from("company_info"),
                data: ValueRef::new(serde_json::json!({"seq": seq})),
            },
        )
    }

    #[tokio::test]
    async fn test_append_and_read_round_trip() {
        let store = store().await;
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();

        store.append(event(workflow_id, tenant_id, 1)).await.unwrap();
        store.append(event(workflow_id, tenant_id, 2)).await.unwrap();

        let events = store
            .get_events(workflow_id, EventRange::all())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence_no, SequenceNumber::new(1));
        assert_eq!(events[1].sequence_no, SequenceNumber::new(2));
        assert_eq!(
            store.latest_sequence(workflow_id).await.unwrap(),
            Some(SequenceNumber::new(2))
        );
    }

    #[tokio::test]
    async fn test_append_density_enforced() {
        let store = store().await;
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();

        store.append(event(workflow_id, tenant_id, 1)).await.unwrap();

        let conflict = store.append(event(workflow_id, tenant_id, 1)).await;
        assert!(matches!(
            conflict.unwrap_err().current_context(),
            StateError::ConflictingWrite { .. }
        ));

        let gap = store.append(event(workflow_id, tenant_id, 4)).await;
        assert!(matches!(
            gap.unwrap_err().current_context(),
            StateError::NonDenseSequence { .. }
        ));
    }

    #[tokio::test]
    async fn test_batch_append_is_transactional() {
        let store = store().await;
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();

        let bad = vec![event(workflow_id, tenant_id, 1), event(workflow_id, tenant_id, 3)];
        assert!(store.append_many(bad).await.is_err());
        assert_eq!(store.latest_sequence(workflow_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bookmark_consume_cas() {
        let store = store().await;
        let bookmark = Bookmark::new(
            WorkflowId::new(),
            TenantId::new(),
            StepId::from("compliance"),
            BookmarkKind::Approval,
            ValueRef::default(),
        );
        let id = bookmark.bookmark_id;
        BookmarkStore::put(&store, bookmark).await.unwrap();

        let consumed = store.consume(id, Utc::now()).await.unwrap();
        assert!(consumed.consumed_at.is_some());

        let err = store.consume(id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::BookmarkAlreadyConsumed { .. }
        ));
    }

    #[tokio::test]
    async fn test_index_scoping_in_sql() {
        let store = store().await;
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        for tenant in [tenant_a, tenant_b] {
            let now = Utc::now();
            IndexStore::insert(
                &store,
                IndexRow {
                    id: WorkflowId::new(),
                    tenant_id: tenant,
                    template_id: TemplateId::new(),
                    market_role: MarketRole::Brp,
                    status: WorkflowStatus::Draft,
                    current_step_id: None,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await
            .unwrap();
        }

        let ctx = OperationContext::new(
            Actor::new(
                UserId::new(),
                "admin",
                gridflow_core::Role::TenantAdmin,
                Some(tenant_a),
            )
            .unwrap(),
        );
        let rows = IndexStore::query(&store, &ctx, WorkflowFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id, tenant_a);
    }

    #[tokio::test]
    async fn test_state_update_stale_write() {
        let store = store().await;
        let template = WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, 1)
            .step("a", "A", StepKind::Form, ValueRef::default(), true, vec![])
            .build()
            .unwrap();
        let mut instance = WorkflowInstance {
            id: WorkflowId::new(),
            tenant_id: TenantId::new(),
            template_id: template.id,
            template_version: 1,
            market_role: MarketRole::Brp,
            status: WorkflowStatus::Draft,
            current_step_id: None,
            step_states: Default::default(),
            metadata: Default::default(),
            created_by: UserId::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 0,
            projected_seq: 0,
        };
        StateStore::insert(&store, instance.clone()).await.unwrap();

        instance.status = WorkflowStatus::InProgress;
        StateStore::update(&store, instance.clone(), 0).await.unwrap();

        let err = StateStore::update(&store, instance.clone(), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::StaleWrite { found: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_template_duplicate_rejected() {
        let store = store().await;
        let template = WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, 1)
            .step("a", "A", StepKind::Form, ValueRef::default(), true, vec![])
            .build()
            .unwrap();
        TemplateStore::put(&store, template.clone()).await.unwrap();

        let again = WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, 1)
            .step("a", "A", StepKind::Form, ValueRef::default(), true, vec![])
            .build()
            .unwrap();
        let err = TemplateStore::put(&store, again).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::DuplicateTemplate { .. }
        ));

        let loaded = TemplateStore::get(&store, MarketRole::Brp, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.name, "BRP-onboarding");
    }
}
