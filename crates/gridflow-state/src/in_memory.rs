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

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::ResultExt as _;
use futures::future::{BoxFuture, FutureExt as _};
use gridflow_core::{
    Bookmark, BookmarkId, MarketRole, OperationContext, SequenceNumber, StepId, TemplateId,
    Tenant, TenantId, TenantStatus, WorkflowEvent, WorkflowId, WorkflowInstance, WorkflowStatus,
    WorkflowTemplate,
};
use tokio::sync::RwLock;

use crate::{
    BookmarkStore, EventRange, EventStore, IndexRow, IndexStore, Page, StateError, StateStore,
    TemplateStore, TenantStore, WorkflowFilter,
};

type EventLogMap = Arc<RwLock<HashMap<WorkflowId, Vec<WorkflowEvent>>>>;
type TemplateKey = (MarketRole, u32);

/// In-memory implementation of every store contract.
///
/// Suitable for tests and single-process deployments. Each map sits behind
/// its own `RwLock`, so readers of one store never contend with writers of
/// another; the event log's writer lock is what makes an append-and-check
/// atomic.
pub struct InMemoryWorkflowStore {
    events: EventLogMap,
    instances: Arc<RwLock<HashMap<WorkflowId, WorkflowInstance>>>,
    index: Arc<RwLock<HashMap<WorkflowId, IndexRow>>>,
    bookmarks: Arc<RwLock<HashMap<BookmarkId, Bookmark>>>,
    templates: Arc<RwLock<HashMap<TemplateKey, Arc<WorkflowTemplate>>>>,
    templates_by_id: Arc<RwLock<HashMap<TemplateId, Arc<WorkflowTemplate>>>>,
    tenants: Arc<RwLock<HashMap<TenantId, Tenant>>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            index: Arc::new(RwLock::new(HashMap::new())),
            bookmarks: Arc::new(RwLock::new(HashMap::new())),
            templates: Arc::new(RwLock::new(HashMap::new())),
            templates_by_id: Arc::new(RwLock::new(HashMap::new())),
            tenants: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate an event against the log it is about to enter.
    ///
    /// `len` is the current log length; the next dense sequence is `len + 1`.
    fn check_sequence(
        workflow_id: WorkflowId,
        len: usize,
        event: &WorkflowEvent,
    ) -> Result<(), StateError> {
        let expected = len as u64 + 1;
        let got = event.sequence_no.value();
        if got == expected {
            Ok(())
        } else if got <= len as u64 {
            // Another writer committed this slot first.
            Err(StateError::ConflictingWrite { workflow_id })
        } else {
            Err(StateError::NonDenseSequence {
                workflow_id,
                expected,
                got,
            })
        }
    }

    /// Clamp `occurred_at` so timestamps never run backwards within a log.
    fn clamp_occurred_at(log: &[WorkflowEvent], event: &mut WorkflowEvent) {
        if let Some(last) = log.last()
            && event.occurred_at < last.occurred_at
        {
            event.occurred_at = last.occurred_at;
        }
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryWorkflowStore {
    fn append(
        &self,
        event: WorkflowEvent,
    ) -> BoxFuture<'_, error_stack::Result<SequenceNumber, StateError>> {
        let events = self.events.clone();

        async move {
            let mut events = events.write().await;
            let log = events.entry(event.workflow_id).or_default();
            Self::check_sequence(event.workflow_id, log.len(), &event)?;

            let mut event = event;
            Self::clamp_occurred_at(log, &mut event);
            let seq = event.sequence_no;
            log.push(event);
            Ok(seq)
        }
        .boxed()
    }

    fn append_many(
        &self,
        batch: Vec<WorkflowEvent>,
    ) -> BoxFuture<'_, error_stack::Result<SequenceNumber, StateError>> {
        let events = self.events.clone();

        async move {
            let Some(first) = batch.first() else {
                return Err(error_stack::report!(StateError::Internal))
                    .attach_printable("append_many called with an empty batch");
            };
            let workflow_id = first.workflow_id;

            let mut events = events.write().await;
            let log = events.entry(workflow_id).or_default();

            // Validate the whole batch before making anything visible.
            for (offset, event) in batch.iter().enumerate() {
                if event.workflow_id != workflow_id {
                    return Err(error_stack::report!(StateError::Internal))
                        .attach_printable("append_many batch spans multiple workflows");
                }
                Self::check_sequence(workflow_id, log.len() + offset, event)?;
            }

            let mut last = SequenceNumber::default();
            for mut event in batch {
                Self::clamp_occurred_at(log, &mut event);
                last = event.sequence_no;
                log.push(event);
            }
            Ok(last)
        }
        .boxed()
    }

    fn get_events(
        &self,
        workflow_id: WorkflowId,
        range: EventRange,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkflowEvent>, StateError>> {
        let events = self.events.clone();

        async move {
            let events = events.read().await;
            let log = events.get(&workflow_id).map(Vec::as_slice).unwrap_or(&[]);
            Ok(log
                .iter()
                .filter(|e| range.contains(e.sequence_no, e.occurred_at))
                .cloned()
                .collect())
        }
        .boxed()
    }

    fn get_events_by_tenant(
        &self,
        tenant_id: TenantId,
        from_time: DateTime<Utc>,
        to_time: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkflowEvent>, StateError>> {
        let events = self.events.clone();

        async move {
            let events = events.read().await;
            let mut matched: Vec<WorkflowEvent> = events
                .values()
                .flatten()
                .filter(|e| {
                    e.tenant_id == tenant_id
                        && e.occurred_at >= from_time
                        && e.occurred_at <= to_time
                })
                .cloned()
                .collect();
            matched.sort_by_key(|e| (e.occurred_at, e.sequence_no));
            matched.truncate(limit);
            Ok(matched)
        }
        .boxed()
    }

    fn latest_sequence(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Option<SequenceNumber>, StateError>> {
        let events = self.events.clone();

        async move {
            let events = events.read().await;
            Ok(events
                .get(&workflow_id)
                .and_then(|log| log.last())
                .map(|e| e.sequence_no))
        }
        .boxed()
    }
}

impl StateStore for InMemoryWorkflowStore {
    fn get(
        &self,
        ctx: &OperationContext,
        id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Option<WorkflowInstance>, StateError>> {
        let instances = self.instances.clone();
        let scope = ctx.scope();

        async move {
            let instances = instances.read().await;
            Ok(instances
                .get(&id)
                .filter(|i| scope.permits(i.tenant_id))
                .cloned())
        }
        .boxed()
    }

    fn insert(
        &self,
        instance: WorkflowInstance,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let instances = self.instances.clone();

        async move {
            let mut instances = instances.write().await;
            instances.insert(instance.id, instance);
            Ok(())
        }
        .boxed()
    }

    fn update(
        &self,
        instance: WorkflowInstance,
        expected_version: u64,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let instances = self.instances.clone();

        async move {
            let mut instances = instances.write().await;
            let stored = instances
                .get_mut(&instance.id)
                .ok_or(StateError::WorkflowNotFound {
                    workflow_id: instance.id,
                })?;
            if stored.version != expected_version {
                return Err(error_stack::report!(StateError::StaleWrite {
                    workflow_id: instance.id,
                    expected: expected_version,
                    found: stored.version,
                }));
            }
            let mut instance = instance;
            instance.version = expected_version + 1;
            *stored = instance;
            Ok(())
        }
        .boxed()
    }

    fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let instances = self.instances.clone();

        async move {
            let mut instances = instances.write().await;
            let stored = instances
                .get_mut(&id)
                .ok_or(StateError::WorkflowNotFound { workflow_id: id })?;
            stored.status = status;
            stored.updated_at = Utc::now();
            Ok(())
        }
        .boxed()
    }

    fn find(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkflowInstance>, StateError>> {
        let instances = self.instances.clone();
        let scope = ctx.scope();

        async move {
            let instances = instances.read().await;
            let mut matched: Vec<WorkflowInstance> = instances
                .values()
                .filter(|i| scope.permits(i.tenant_id))
                .filter(|i| filter.matches(&IndexRow::from_instance(i)))
                .cloned()
                .collect();
            matched.sort_by_key(|i| i.created_at);
            Ok(matched)
        }
        .boxed()
    }

    fn delete(&self, id: WorkflowId) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let instances = self.instances.clone();

        async move {
            let mut instances = instances.write().await;
            instances.remove(&id);
            Ok(())
        }
        .boxed()
    }
}

impl IndexStore for InMemoryWorkflowStore {
    fn insert(&self, row: IndexRow) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let index = self.index.clone();

        async move {
            let mut index = index.write().await;
            index.insert(row.id, row);
            Ok(())
        }
        .boxed()
    }

    fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        current_step_id: Option<StepId>,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let index = self.index.clone();

        async move {
            let mut index = index.write().await;
            let row = index
                .get_mut(&id)
                .ok_or(StateError::WorkflowNotFound { workflow_id: id })?;
            if row.status == status && row.current_step_id == current_step_id {
                // Idempotent re-application; leave updated_at alone.
                return Ok(());
            }
            row.status = status;
            row.current_step_id = current_step_id;
            row.updated_at = Utc::now();
            Ok(())
        }
        .boxed()
    }

    fn get(
        &self,
        ctx: &OperationContext,
        id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Option<IndexRow>, StateError>> {
        let index = self.index.clone();
        let scope = ctx.scope();

        async move {
            let index = index.read().await;
            Ok(index
                .get(&id)
                .filter(|row| scope.permits(row.tenant_id))
                .cloned())
        }
        .boxed()
    }

    fn query(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
        page: Page,
    ) -> BoxFuture<'_, error_stack::Result<Vec<IndexRow>, StateError>> {
        let index = self.index.clone();
        let scope = ctx.scope();

        async move {
            let index = index.read().await;
            let mut rows: Vec<IndexRow> = index
                .values()
                .filter(|row| scope.permits(row.tenant_id))
                .filter(|row| filter.matches(row))
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(rows
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
    ) -> BoxFuture<'_, error_stack::Result<u64, StateError>> {
        let index = self.index.clone();
        let scope = ctx.scope();

        async move {
            let index = index.read().await;
            Ok(index
                .values()
                .filter(|row| scope.permits(row.tenant_id))
                .filter(|row| filter.matches(row))
                .count() as u64)
        }
        .boxed()
    }

    fn delete(&self, id: WorkflowId) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let index = self.index.clone();

        async move {
            let mut index = index.write().await;
            index.remove(&id);
            Ok(())
        }
        .boxed()
    }
}

impl BookmarkStore for InMemoryWorkflowStore {
    fn put(&self, bookmark: Bookmark) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let bookmarks = self.bookmarks.clone();

        async move {
            let mut bookmarks = bookmarks.write().await;
            let duplicate = bookmarks.values().any(|b| {
                b.workflow_id == bookmark.workflow_id
                    && b.step_id == bookmark.step_id
                    && b.is_active()
            });
            if duplicate {
                return Err(error_stack::report!(StateError::ActiveBookmarkExists {
                    workflow_id: bookmark.workflow_id,
                    step_id: bookmark.step_id.clone(),
                }));
            }
            bookmarks.insert(bookmark.bookmark_id, bookmark);
            Ok(())
        }
        .boxed()
    }

    fn get(
        &self,
        bookmark_id: BookmarkId,
    ) -> BoxFuture<'_, error_stack::Result<Option<Bookmark>, StateError>> {
        let bookmarks = self.bookmarks.clone();

        async move {
            let bookmarks = bookmarks.read().await;
            Ok(bookmarks.get(&bookmark_id).cloned())
        }
        .boxed()
    }

    fn consume(
        &self,
        bookmark_id: BookmarkId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, error_stack::Result<Bookmark, StateError>> {
        let bookmarks = self.bookmarks.clone();

        async move {
            let mut bookmarks = bookmarks.write().await;
            let bookmark = bookmarks
                .get_mut(&bookmark_id)
                .ok_or(StateError::BookmarkNotFound { bookmark_id })?;
            if !bookmark.is_active() {
                return Err(error_stack::report!(StateError::BookmarkAlreadyConsumed {
                    bookmark_id,
                }));
            }
            bookmark.consumed_at = Some(at);
            Ok(bookmark.clone())
        }
        .boxed()
    }

    fn find_active(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Vec<Bookmark>, StateError>> {
        let bookmarks = self.bookmarks.clone();

        async move {
            let bookmarks = bookmarks.read().await;
            let mut active: Vec<Bookmark> = bookmarks
                .values()
                .filter(|b| b.workflow_id == workflow_id && b.is_active())
                .cloned()
                .collect();
            active.sort_by_key(|b| b.created_at);
            Ok(active)
        }
        .boxed()
    }

    fn find_expired(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, error_stack::Result<Vec<Bookmark>, StateError>> {
        let bookmarks = self.bookmarks.clone();

        async move {
            let bookmarks = bookmarks.read().await;
            Ok(bookmarks
                .values()
                .filter(|b| b.is_active() && b.is_expired_at(now))
                .cloned()
                .collect())
        }
        .boxed()
    }

    fn delete_for_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let bookmarks = self.bookmarks.clone();

        async move {
            let mut bookmarks = bookmarks.write().await;
            bookmarks.retain(|_, b| b.workflow_id != workflow_id);
            Ok(())
        }
        .boxed()
    }
}

impl TemplateStore for InMemoryWorkflowStore {
    fn put(
        &self,
        template: WorkflowTemplate,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let templates = self.templates.clone();
        let templates_by_id = self.templates_by_id.clone();

        async move {
            let mut templates = templates.write().await;
            let key = (template.market_role, template.version);
            if templates.contains_key(&key) {
                return Err(error_stack::report!(StateError::DuplicateTemplate {
                    market_role: template.market_role,
                    version: template.version,
                }));
            }
            let template = Arc::new(template);
            templates.insert(key, template.clone());
            templates_by_id.write().await.insert(template.id, template);
            Ok(())
        }
        .boxed()
    }

    fn get(
        &self,
        market_role: MarketRole,
        version: u32,
    ) -> BoxFuture<'_, error_stack::Result<Option<Arc<WorkflowTemplate>>, StateError>> {
        let templates = self.templates.clone();

        async move {
            let templates = templates.read().await;
            Ok(templates.get(&(market_role, version)).cloned())
        }
        .boxed()
    }

    fn get_by_id(
        &self,
        template_id: TemplateId,
    ) -> BoxFuture<'_, error_stack::Result<Option<Arc<WorkflowTemplate>>, StateError>> {
        let templates_by_id = self.templates_by_id.clone();

        async move {
            let templates_by_id = templates_by_id.read().await;
            Ok(templates_by_id.get(&template_id).cloned())
        }
        .boxed()
    }

    fn latest(
        &self,
        market_role: MarketRole,
    ) -> BoxFuture<'_, error_stack::Result<Option<Arc<WorkflowTemplate>>, StateError>> {
        let templates = self.templates.clone();

        async move {
            let templates = templates.read().await;
            Ok(templates
                .iter()
                .filter(|((role, _), _)| *role == market_role)
                .max_by_key(|((_, version), _)| *version)
                .map(|(_, t)| t.clone()))
        }
        .boxed()
    }

    fn list(
        &self,
        market_role: MarketRole,
    ) -> BoxFuture<'_, error_stack::Result<Vec<Arc<WorkflowTemplate>>, StateError>> {
        let templates = self.templates.clone();

        async move {
            let templates = templates.read().await;
            let mut matched: Vec<Arc<WorkflowTemplate>> = templates
                .iter()
                .filter(|((role, _), _)| *role == market_role)
                .map(|(_, t)| t.clone())
                .collect();
            matched.sort_by_key(|t| t.version);
            Ok(matched)
        }
        .boxed()
    }
}

impl TenantStore for InMemoryWorkflowStore {
    fn put(&self, tenant: Tenant) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let tenants = self.tenants.clone();

        async move {
            let mut tenants = tenants.write().await;
            tenants.insert(tenant.id, tenant);
            Ok(())
        }
        .boxed()
    }

    fn get(
        &self,
        tenant_id: TenantId,
    ) -> BoxFuture<'_, error_stack::Result<Option<Tenant>, StateError>> {
        let tenants = self.tenants.clone();

        async move {
            let tenants = tenants.read().await;
            Ok(tenants.get(&tenant_id).cloned())
        }
        .boxed()
    }

    fn set_status(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>> {
        let tenants = self.tenants.clone();

        async move {
            let mut tenants = tenants.write().await;
            let tenant = tenants
                .get_mut(&tenant_id)
                .ok_or(StateError::TenantNotFound { tenant_id })?;
            tenant.status = status;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Actor, EventBody, Role, UserId};
    use serde_json::json;

    fn event(workflow_id: WorkflowId, tenant_id: TenantId, seq: u64) -> WorkflowEvent {
        WorkflowEvent::new(
            workflow_id,
            tenant_id,
            SequenceNumber::new(seq),
            UserId::new(),
            EventBody::DataUpdated {
                step_id: StepId::from("company_info"),
                data: gridflow_core::ValueRef::new(json!({"seq": seq})),
            },
        )
    }

    fn instance(tenant_id: TenantId) -> WorkflowInstance {
        WorkflowInstance {
            id: WorkflowId::new(),
            tenant_id,
            template_id: TemplateId::new(),
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
        }
    }

    fn ops_ctx() -> OperationContext {
        OperationContext::new(Actor::market_ops(UserId::new(), "ops"))
    }

    fn tenant_ctx(tenant_id: TenantId) -> OperationContext {
        OperationContext::new(
            Actor::new(UserId::new(), "admin", Role::TenantAdmin, Some(tenant_id)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_append_assigns_dense_sequence() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();

        store.append(event(workflow_id, tenant_id, 1)).await.unwrap();
        store.append(event(workflow_id, tenant_id, 2)).await.unwrap();

        let latest = store.latest_sequence(workflow_id).await.unwrap();
        assert_eq!(latest, Some(SequenceNumber::new(2)));
    }

    #[tokio::test]
    async fn test_append_conflicting_sequence() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();

        store.append(event(workflow_id, tenant_id, 1)).await.unwrap();
        let err = store
            .append(event(workflow_id, tenant_id, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::ConflictingWrite { .. }
        ));
    }

    #[tokio::test]
    async fn test_append_gap_is_integrity_error() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();

        store.append(event(workflow_id, tenant_id, 1)).await.unwrap();
        let err = store
            .append(event(workflow_id, tenant_id, 3))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::NonDenseSequence {
                expected: 2,
                got: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_append_many_is_atomic() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();

        // Second event in the batch has a bad sequence; nothing must land.
        let batch = vec![event(workflow_id, tenant_id, 1), event(workflow_id, tenant_id, 5)];
        assert!(store.append_many(batch).await.is_err());
        assert_eq!(store.latest_sequence(workflow_id).await.unwrap(), None);

        let batch = vec![event(workflow_id, tenant_id, 1), event(workflow_id, tenant_id, 2)];
        let last = store.append_many(batch).await.unwrap();
        assert_eq!(last, SequenceNumber::new(2));
    }

    #[tokio::test]
    async fn test_state_store_scoping() {
        let store = InMemoryWorkflowStore::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let mine = instance(tenant_a);
        let theirs = instance(tenant_b);
        let mine_id = mine.id;
        let theirs_id = theirs.id;
        StateStore::insert(&store, mine).await.unwrap();
        StateStore::insert(&store, theirs).await.unwrap();

        let ctx = tenant_ctx(tenant_a);
        assert!(StateStore::get(&store, &ctx, mine_id).await.unwrap().is_some());
        // Cross-tenant reads look exactly like absence.
        assert!(StateStore::get(&store, &ctx, theirs_id).await.unwrap().is_none());

        let all = StateStore::find(&store, &ops_ctx(), WorkflowFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_state_store_stale_write() {
        let store = InMemoryWorkflowStore::new();
        let mut inst = instance(TenantId::new());
        StateStore::insert(&store, inst.clone()).await.unwrap();

        inst.status = WorkflowStatus::InProgress;
        StateStore::update(&store, inst.clone(), 0).await.unwrap();

        // A second writer still holding version 0 must lose.
        let err = StateStore::update(&store, inst.clone(), 0).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::StaleWrite {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_index_query_scoped_and_paged() {
        let store = InMemoryWorkflowStore::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        for tenant in [tenant_a, tenant_a, tenant_b] {
            IndexStore::insert(&store, IndexRow::from_instance(&instance(tenant)))
                .await
                .unwrap();
        }

        let rows = IndexStore::query(
            &store,
            &tenant_ctx(tenant_a),
            WorkflowFilter::default(),
            Page::default(),
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.tenant_id == tenant_a));

        let count = IndexStore::count(&store, &ops_ctx(), WorkflowFilter::default())
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_bookmark_consumed_exactly_once() {
        let store = InMemoryWorkflowStore::new();
        let bookmark = Bookmark::new(
            WorkflowId::new(),
            TenantId::new(),
            StepId::from("compliance"),
            gridflow_core::BookmarkKind::Approval,
            Default::default(),
        );
        let id = bookmark.bookmark_id;
        BookmarkStore::put(&store, bookmark).await.unwrap();

        store.consume(id, Utc::now()).await.unwrap();
        let err = store.consume(id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::BookmarkAlreadyConsumed { .. }
        ));
    }

    #[tokio::test]
    async fn test_one_active_bookmark_per_step() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();
        let first = Bookmark::new(
            workflow_id,
            tenant_id,
            StepId::from("compliance"),
            gridflow_core::BookmarkKind::Approval,
            Default::default(),
        );
        let first_id = first.bookmark_id;
        BookmarkStore::put(&store, first).await.unwrap();

        let second = Bookmark::new(
            workflow_id,
            tenant_id,
            StepId::from("compliance"),
            gridflow_core::BookmarkKind::Approval,
            Default::default(),
        );
        let err = BookmarkStore::put(&store, second.clone()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::ActiveBookmarkExists { .. }
        ));

        // Once consumed, a new bookmark for the step is allowed.
        store.consume(first_id, Utc::now()).await.unwrap();
        BookmarkStore::put(&store, second).await.unwrap();
    }

    #[tokio::test]
    async fn test_template_versions() {
        use gridflow_core::{StepKind, ValueRef, WorkflowTemplateBuilder};

        let store = InMemoryWorkflowStore::new();
        for version in [1u32, 2] {
            let template = WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, version)
                .step("a", "A", StepKind::Form, ValueRef::default(), true, vec![])
                .build()
                .unwrap();
            TemplateStore::put(&store, template).await.unwrap();
        }

        let latest = store.latest(MarketRole::Brp).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);

        let duplicate = WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, 2)
            .step("a", "A", gridflow_core::StepKind::Form, Default::default(), true, vec![])
            .build()
            .unwrap();
        let err = TemplateStore::put(&store, duplicate).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StateError::DuplicateTemplate { version: 2, .. }
        ));
    }
}
