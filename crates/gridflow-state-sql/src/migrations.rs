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

use error_stack::{Result, ResultExt as _};
use gridflow_state::StateError;
use sqlx::{Row as _, SqlitePool};

/// Run migrations to set up the database schema
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StateError> {
    create_migrations_table(pool).await?;

    apply_migration(pool, "001_create_workflow_schema", || {
        create_workflow_schema(pool)
    })
    .await?;

    Ok(())
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<(), StateError> {
    let sql = r#"
        CREATE TABLE IF NOT EXISTS _gridflow_migrations (
            name TEXT PRIMARY KEY,
            applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )
    "#;

    sqlx::query(sql)
        .execute(pool)
        .await
        .change_context(StateError::Initialization)?;

    Ok(())
}

/// Apply a migration if it hasn't been applied yet
async fn apply_migration<F, Fut>(
    pool: &SqlitePool,
    name: &str,
    migration_fn: F,
) -> Result<(), StateError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), StateError>>,
{
    let row = sqlx::query("SELECT COUNT(*) as count FROM _gridflow_migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .change_context(StateError::Initialization)?;

    let count: i64 = row
        .try_get("count")
        .change_context(StateError::Initialization)?;

    if count > 0 {
        // Migration already applied
        return Ok(());
    }

    migration_fn().await?;

    sqlx::query("INSERT INTO _gridflow_migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .change_context(StateError::Initialization)?;

    Ok(())
}

/// Create the workflow schema in one migration
async fn create_workflow_schema(pool: &SqlitePool) -> Result<(), StateError> {
    let table_commands = vec![
        // Append-only event log; (workflow_id, sequence_no) is the identity
        // the density invariant is enforced against.
        r#"
            CREATE TABLE IF NOT EXISTS workflow_events (
                workflow_id TEXT NOT NULL,
                sequence_no INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                performed_by TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (workflow_id, sequence_no)
            )
        "#,
        // Full instance documents with the optimistic version mirrored out
        // of the JSON for the compare-and-set update.
        r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
        "#,
        // Queryable projection of workflow headers.
        r#"
            CREATE TABLE IF NOT EXISTS workflow_index (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                template_id TEXT NOT NULL,
                market_role TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
        "#,
        // Bookmarks; consumed_at NULL means active.
        r#"
            CREATE TABLE IF NOT EXISTS workflow_bookmarks (
                bookmark_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload_shape TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                consumed_at TEXT
            )
        "#,
        // Published templates, unique per (market_role, version).
        r#"
            CREATE TABLE IF NOT EXISTS workflow_templates (
                market_role TEXT NOT NULL,
                version INTEGER NOT NULL,
                template_id TEXT NOT NULL,
                document TEXT NOT NULL,
                published_at TEXT NOT NULL,
                PRIMARY KEY (market_role, version)
            )
        "#,
        // Tenant directory; only what the engine's preconditions need.
        r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#,
    ];

    for sql in table_commands {
        sqlx::query(sql)
            .execute(pool)
            .await
            .change_context(StateError::Initialization)?;
    }

    let index_commands = vec![
        "CREATE INDEX IF NOT EXISTS idx_events_tenant_time ON workflow_events(tenant_id, occurred_at)",
        "CREATE INDEX IF NOT EXISTS idx_instances_tenant ON workflow_instances(tenant_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_index_tenant_status ON workflow_index(tenant_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_index_created_at ON workflow_index(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_bookmarks_workflow ON workflow_bookmarks(workflow_id, consumed_at)",
        "CREATE INDEX IF NOT EXISTS idx_bookmarks_expiry ON workflow_bookmarks(expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_templates_id ON workflow_templates(template_id)",
    ];

    for sql in index_commands {
        sqlx::query(sql)
            .execute(pool)
            .await
            .change_context(StateError::Initialization)?;
    }

    Ok(())
}
