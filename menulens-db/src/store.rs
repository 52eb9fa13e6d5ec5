//! The store trait the pipeline talks to, with the Postgres system of record
//! and an in-memory mirror for tests and ephemeral development runs.

use crate::db;
use crate::pool::ConnectionPool;
use crate::types::{
    EventDraft, EventRow, ItemImage, MenuItem, Progress, ProviderInfo, ProviderRecord, Session,
    SessionSnapshot, SessionStatus, Stage, StageCounts, StageFailure, StagePayload, StageStatus,
    StuckStage, session_summary_payload,
};
use crate::{PoolError, QueryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::result::DatabaseErrorKind;
use hashbrown::HashMap;
use miette::Diagnostic;
use std::collections::BTreeMap;
use std::sync::Mutex;
use strum::IntoEnumIterator;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("session {0} already exists")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("session {0} is already terminal")]
    AlreadyTerminal(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("couldn't get a database connection")]
    Pool(#[from] PoolError),

    #[error("store task failed to run")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Whether retrying the same call may succeed. The result sink retries
    /// these a bounded number of times before giving up.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Pool(_) => true,
            StoreError::Query(QueryError::DatabaseError(kind, _)) => matches!(
                kind,
                DatabaseErrorKind::SerializationFailure | DatabaseErrorKind::ClosedConnection
            ),
            _ => false,
        }
    }
}

/// Persistence for sessions, items, stage state, audit rows, and the event
/// log. Mutating operations return the event row(s) they appended; `None`
/// means the call was an idempotent no-op and nothing should be published.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        session_id: &str,
        items: Vec<String>,
        metadata: serde_json::Value,
    ) -> Result<(SessionSnapshot, Vec<EventRow>), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, StoreError>;

    async fn get_item(&self, session_id: &str, item_id: i32) -> Result<MenuItem, StoreError>;

    async fn mark_stage_processing(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
    ) -> Result<Option<EventRow>, StoreError>;

    async fn record_stage_success(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
        payload: StagePayload,
        info: ProviderInfo,
    ) -> Result<Option<EventRow>, StoreError>;

    async fn record_stage_failure(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
        failure: StageFailure,
        info: ProviderInfo,
    ) -> Result<Option<EventRow>, StoreError>;

    async fn get_progress(&self, session_id: &str) -> Result<Progress, StoreError>;

    async fn search_items(
        &self,
        query: &str,
        category: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MenuItem>, StoreError>;

    async fn complete_session_if_done(
        &self,
        session_id: &str,
    ) -> Result<Option<EventRow>, StoreError>;

    async fn cancel_session(&self, session_id: &str) -> Result<EventRow, StoreError>;

    async fn events_after(
        &self,
        session_id: &str,
        after_event_id: i64,
    ) -> Result<Vec<EventRow>, StoreError>;

    async fn provider_records(&self, session_id: &str)
    -> Result<Vec<ProviderRecord>, StoreError>;

    async fn stuck_stages(
        &self,
        stage: Stage,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StuckStage>, StoreError>;

    async fn prune_events(&self, terminal_before: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Postgres-backed store. Synchronous diesel work runs on the blocking
/// thread pool; one transaction per call.
#[derive(Clone)]
pub struct PgStore {
    pool: ConnectionPool,
}

impl PgStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create_session(
        &self,
        session_id: &str,
        items: Vec<String>,
        metadata: serde_json::Value,
    ) -> Result<(SessionSnapshot, Vec<EventRow>), StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::create_session(conn, &session_id, &items, &metadata))
            .await
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::get_session(conn, &session_id)).await
    }

    async fn get_item(&self, session_id: &str, item_id: i32) -> Result<MenuItem, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::get_item(conn, &session_id, item_id))
            .await
    }

    async fn mark_stage_processing(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
    ) -> Result<Option<EventRow>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::mark_stage_processing(conn, &session_id, item_id, stage))
            .await
    }

    async fn record_stage_success(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
        payload: StagePayload,
        info: ProviderInfo,
    ) -> Result<Option<EventRow>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            db::record_stage_success(conn, &session_id, item_id, stage, &payload, &info)
        })
        .await
    }

    async fn record_stage_failure(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
        failure: StageFailure,
        info: ProviderInfo,
    ) -> Result<Option<EventRow>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            db::record_stage_failure(conn, &session_id, item_id, stage, &failure, &info)
        })
        .await
    }

    async fn get_progress(&self, session_id: &str) -> Result<Progress, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::get_progress(conn, &session_id)).await
    }

    async fn search_items(
        &self,
        query: &str,
        category: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MenuItem>, StoreError> {
        let query = query.to_string();
        let category = category.map(str::to_string);
        self.run(move |conn| db::search_items(conn, &query, category.as_deref(), limit))
            .await
    }

    async fn complete_session_if_done(
        &self,
        session_id: &str,
    ) -> Result<Option<EventRow>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::complete_session_if_done(conn, &session_id))
            .await
    }

    async fn cancel_session(&self, session_id: &str) -> Result<EventRow, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::cancel_session(conn, &session_id))
            .await
    }

    async fn events_after(
        &self,
        session_id: &str,
        after_event_id: i64,
    ) -> Result<Vec<EventRow>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::events_after(conn, &session_id, after_event_id))
            .await
    }

    async fn provider_records(
        &self,
        session_id: &str,
    ) -> Result<Vec<ProviderRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| db::provider_records(conn, &session_id))
            .await
    }

    async fn stuck_stages(
        &self,
        stage: Stage,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StuckStage>, StoreError> {
        self.run(move |conn| db::stuck_stages(conn, stage, cutoff.naive_utc()))
            .await
    }

    async fn prune_events(&self, terminal_before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.run(move |conn| db::prune_events(conn, terminal_before.naive_utc()))
            .await
    }
}

struct MemStage {
    status: StageStatus,
    updated_at: DateTime<Utc>,
}

struct MemSession {
    session: Session,
    items: Vec<MenuItem>,
    stages: BTreeMap<(i32, Stage), MemStage>,
    provider_rows: Vec<ProviderRecord>,
    events: Vec<EventRow>,
    // Never resets, even after pruning, so ids stay monotonic.
    last_event_id: i64,
}

impl MemSession {
    fn append_event(&mut self, draft: EventDraft) -> EventRow {
        self.last_event_id += 1;
        let event_id = self.last_event_id;
        let event = EventRow {
            event_id,
            session_id: self.session.session_id.clone(),
            item_id: draft.item_id,
            stage: draft.stage,
            event_type: draft.event_type,
            payload: draft.payload,
            provider: draft.provider,
            elapsed_ms: draft.elapsed_ms,
            fallback_used: draft.fallback_used,
            timestamp: Utc::now(),
        };
        self.session.updated_at = event.timestamp;
        self.events.push(event.clone());
        event
    }

    fn stage_statuses(&self) -> Vec<(i32, Stage, StageStatus)> {
        self.stages
            .iter()
            .map(|((item_id, stage), mem)| (*item_id, *stage, mem.status))
            .collect()
    }

    fn sync_item_statuses(&mut self, item_id: i32) {
        let status_of = |stage: Stage| {
            self.stages
                .get(&(item_id, stage))
                .map(|s| s.status)
                .unwrap_or(StageStatus::Pending)
        };
        let translation = status_of(Stage::Translation);
        let description = status_of(Stage::Description);
        let image = db::merge_image_statuses(&[
            status_of(Stage::ImageSearch),
            status_of(Stage::ImageGen),
        ]);
        if let Some(item) = self.items.iter_mut().find(|i| i.item_id == item_id) {
            item.translation_status = translation;
            item.description_status = description;
            item.image_status = image;
            item.updated_at = Utc::now();
        }
    }

    fn record_attempts(&mut self, item_id: i32, stage: Stage, info: &ProviderInfo) {
        for attempt in &info.attempts {
            self.provider_rows.push(ProviderRecord {
                item_id,
                stage,
                provider: attempt.provider.clone(),
                succeeded: attempt.error_kind.is_none(),
                error_class: attempt
                    .error_kind
                    .map(|kind| crate::types::FailureKind::from(kind).to_string()),
                error_message: attempt.error_message.clone(),
                processed_at: Utc::now(),
                processing_time_ms: attempt.elapsed_ms,
                fallback_used: attempt.fallback_used,
            });
        }
    }
}

/// The arena-and-index mirror of the Postgres store. Everything lives behind
/// one mutex; operations are short and never await while holding it.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, MemSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut MemSession) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let session = inner
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        f(session)
    }
}

fn apply_payload_to_item(
    item: &mut MenuItem,
    payload: &StagePayload,
    info: &ProviderInfo,
    now: DateTime<Utc>,
) {
    match payload {
        StagePayload::Translation { english, category } => {
            item.english_text = Some(english.clone());
            item.category = Some(category.clone());
        }
        StagePayload::Description { description } => {
            item.description = Some(description.clone());
        }
        StagePayload::Allergens { allergens } => {
            item.allergens = Some(allergens.clone());
        }
        StagePayload::Ingredients { ingredients } => {
            item.ingredients = Some(ingredients.clone());
        }
        StagePayload::ImageSearch { images } => {
            item.images.extend(images.iter().map(|image| ItemImage {
                stage: Stage::ImageSearch,
                image_url: image.image_url.clone(),
                storage_key: image.storage_key.clone(),
                prompt: image.prompt.clone(),
                provider: info.provider.clone(),
                fallback_used: info.fallback_used,
                metadata: image.metadata.clone(),
                created_at: now,
            }));
        }
        StagePayload::ImageGen { image } => {
            item.images.push(ItemImage {
                stage: Stage::ImageGen,
                image_url: image.image_url.clone(),
                storage_key: image.storage_key.clone(),
                prompt: image.prompt.clone(),
                provider: info.provider.clone(),
                fallback_used: info.fallback_used,
                metadata: image.metadata.clone(),
                created_at: now,
            });
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(
        &self,
        session_id: &str,
        items: Vec<String>,
        metadata: serde_json::Value,
    ) -> Result<(SessionSnapshot, Vec<EventRow>), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if inner.contains_key(session_id) {
            return Err(StoreError::Conflict(session_id.to_string()));
        }

        let now = Utc::now();
        let menu_items: Vec<MenuItem> = items
            .iter()
            .enumerate()
            .map(|(index, japanese_text)| MenuItem {
                session_id: session_id.to_string(),
                item_id: index as i32,
                japanese_text: japanese_text.clone(),
                english_text: None,
                category: None,
                description: None,
                allergens: None,
                ingredients: None,
                translation_status: StageStatus::Pending,
                description_status: StageStatus::Pending,
                image_status: StageStatus::Pending,
                images: Vec::new(),
                created_at: now,
                updated_at: now,
            })
            .collect();

        let stages: BTreeMap<(i32, Stage), MemStage> = (0..items.len() as i32)
            .flat_map(|item_id| {
                Stage::iter().map(move |stage| {
                    (
                        (item_id, stage),
                        MemStage {
                            status: StageStatus::Pending,
                            updated_at: now,
                        },
                    )
                })
            })
            .collect();

        let mut mem = MemSession {
            session: Session {
                session_id: session_id.to_string(),
                total_items: items.len() as i32,
                status: SessionStatus::Processing,
                metadata,
                created_at: now,
                updated_at: now,
                completed_at: None,
            },
            items: menu_items,
            stages,
            provider_rows: Vec::new(),
            events: Vec::new(),
            last_event_id: 0,
        };

        let mut events = Vec::with_capacity(items.len() + 1);
        events.push(mem.append_event(EventDraft::session_started(items.len() as i32)));
        for (index, japanese_text) in items.iter().enumerate() {
            events.push(mem.append_event(EventDraft::item_created(index as i32, japanese_text)));
        }

        let snapshot = SessionSnapshot {
            session: mem.session.clone(),
            items: mem.items.clone(),
        };
        inner.insert(session_id.to_string(), mem);
        Ok((snapshot, events))
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        self.with_session(session_id, |mem| {
            Ok(SessionSnapshot {
                session: mem.session.clone(),
                items: mem.items.clone(),
            })
        })
    }

    async fn get_item(&self, session_id: &str, item_id: i32) -> Result<MenuItem, StoreError> {
        self.with_session(session_id, |mem| {
            mem.items
                .iter()
                .find(|i| i.item_id == item_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("{session_id}/{item_id}")))
        })
    }

    async fn mark_stage_processing(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
    ) -> Result<Option<EventRow>, StoreError> {
        self.with_session(session_id, |mem| {
            let mem_stage = mem
                .stages
                .get_mut(&(item_id, stage))
                .ok_or_else(|| StoreError::NotFound(format!("{session_id}/{item_id}/{stage}")))?;
            if mem_stage.status != StageStatus::Pending {
                return Ok(None);
            }
            mem_stage.status = StageStatus::Processing;
            mem_stage.updated_at = Utc::now();
            mem.sync_item_statuses(item_id);
            Ok(Some(mem.append_event(EventDraft::stage_processing(
                item_id, stage,
            ))))
        })
    }

    async fn record_stage_success(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
        payload: StagePayload,
        info: ProviderInfo,
    ) -> Result<Option<EventRow>, StoreError> {
        self.with_session(session_id, |mem| {
            let mem_stage = mem
                .stages
                .get_mut(&(item_id, stage))
                .ok_or_else(|| StoreError::NotFound(format!("{session_id}/{item_id}/{stage}")))?;
            let already_terminal = mem_stage.status.is_terminal();
            if !already_terminal {
                mem_stage.status = StageStatus::Completed;
                mem_stage.updated_at = Utc::now();
            }
            mem.record_attempts(item_id, stage, &info);
            if already_terminal {
                return Ok(None);
            }

            let now = Utc::now();
            if let Some(item) = mem.items.iter_mut().find(|i| i.item_id == item_id) {
                apply_payload_to_item(item, &payload, &info, now);
            }
            mem.sync_item_statuses(item_id);
            Ok(Some(mem.append_event(EventDraft::stage_completed(
                item_id,
                stage,
                payload.event_payload(),
                &info,
            ))))
        })
    }

    async fn record_stage_failure(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
        failure: StageFailure,
        info: ProviderInfo,
    ) -> Result<Option<EventRow>, StoreError> {
        self.with_session(session_id, |mem| {
            let mem_stage = mem
                .stages
                .get_mut(&(item_id, stage))
                .ok_or_else(|| StoreError::NotFound(format!("{session_id}/{item_id}/{stage}")))?;
            let already_terminal = mem_stage.status.is_terminal();
            if !already_terminal {
                mem_stage.status = StageStatus::Failed;
                mem_stage.updated_at = Utc::now();
            }
            mem.record_attempts(item_id, stage, &info);
            if already_terminal {
                return Ok(None);
            }

            mem.sync_item_statuses(item_id);
            Ok(Some(mem.append_event(EventDraft::stage_failed(
                item_id, stage, &failure, &info,
            ))))
        })
    }

    async fn get_progress(&self, session_id: &str) -> Result<Progress, StoreError> {
        self.with_session(session_id, |mem| {
            let mut per_stage_counts: BTreeMap<Stage, StageCounts> = BTreeMap::new();
            let mut terminal_by_item: HashMap<i32, bool> = HashMap::new();
            let mut terminal_stages = 0usize;

            for ((item_id, stage), mem_stage) in &mem.stages {
                per_stage_counts
                    .entry(*stage)
                    .or_default()
                    .add(mem_stage.status);
                let entry = terminal_by_item.entry(*item_id).or_insert(true);
                *entry = *entry && mem_stage.status.is_terminal();
                if mem_stage.status.is_terminal() {
                    terminal_stages += 1;
                }
            }

            let fully_completed = terminal_by_item.values().filter(|t| **t).count() as i64;
            let percentage = if mem.stages.is_empty() {
                0.0
            } else {
                terminal_stages as f64 / mem.stages.len() as f64 * 100.0
            };

            Ok(Progress {
                total: mem.session.total_items as i64,
                per_stage_counts,
                fully_completed,
                percentage,
            })
        })
    }

    async fn search_items(
        &self,
        query: &str,
        category: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MenuItem>, StoreError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let needle = query.to_lowercase();
        let mut matches: Vec<MenuItem> = inner
            .values()
            .flat_map(|mem| mem.items.iter())
            .filter(|item| {
                let text_match = item.japanese_text.to_lowercase().contains(&needle)
                    || item
                        .english_text
                        .as_ref()
                        .is_some_and(|e| e.to_lowercase().contains(&needle));
                let category_match = category
                    .is_none_or(|c| item.category.as_deref() == Some(c));
                text_match && category_match
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matches.truncate(limit.max(0) as usize);
        Ok(matches)
    }

    async fn complete_session_if_done(
        &self,
        session_id: &str,
    ) -> Result<Option<EventRow>, StoreError> {
        self.with_session(session_id, |mem| {
            if mem.session.status != SessionStatus::Processing {
                return Ok(None);
            }
            if mem.stages.values().any(|s| !s.status.is_terminal()) {
                return Ok(None);
            }

            let now = Utc::now();
            mem.session.status = SessionStatus::Completed;
            mem.session.completed_at = Some(now);
            let payload = session_summary_payload(
                SessionStatus::Completed,
                mem.session.total_items,
                &mem.stage_statuses(),
            );
            Ok(Some(mem.append_event(EventDraft::session_completed(payload))))
        })
    }

    async fn cancel_session(&self, session_id: &str) -> Result<EventRow, StoreError> {
        self.with_session(session_id, |mem| {
            if mem.session.status.is_terminal() {
                return Err(StoreError::AlreadyTerminal(session_id.to_string()));
            }
            let now = Utc::now();
            mem.session.status = SessionStatus::Failed;
            mem.session.completed_at = Some(now);
            let payload = session_summary_payload(
                SessionStatus::Failed,
                mem.session.total_items,
                &mem.stage_statuses(),
            );
            Ok(mem.append_event(EventDraft::session_completed(payload)))
        })
    }

    async fn events_after(
        &self,
        session_id: &str,
        after_event_id: i64,
    ) -> Result<Vec<EventRow>, StoreError> {
        self.with_session(session_id, |mem| {
            Ok(mem
                .events
                .iter()
                .filter(|e| e.event_id > after_event_id)
                .cloned()
                .collect())
        })
    }

    async fn provider_records(
        &self,
        session_id: &str,
    ) -> Result<Vec<ProviderRecord>, StoreError> {
        self.with_session(session_id, |mem| Ok(mem.provider_rows.clone()))
    }

    async fn stuck_stages(
        &self,
        stage: Stage,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StuckStage>, StoreError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let mut stuck = Vec::new();
        for (session_id, mem) in inner.iter() {
            for ((item_id, item_stage), mem_stage) in &mem.stages {
                if *item_stage == stage
                    && mem_stage.status == StageStatus::Processing
                    && mem_stage.updated_at < cutoff
                {
                    stuck.push(StuckStage {
                        session_id: session_id.clone(),
                        item_id: *item_id,
                        stage,
                    });
                }
            }
        }
        Ok(stuck)
    }

    async fn prune_events(&self, terminal_before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let mut pruned = 0;
        for mem in inner.values_mut() {
            let expired = mem.session.status.is_terminal()
                && mem
                    .session
                    .completed_at
                    .is_some_and(|t| t < terminal_before);
            if expired {
                pruned += mem.events.len();
                mem.events.clear();
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageRecord;

    fn info(provider: &str) -> ProviderInfo {
        ProviderInfo {
            provider: provider.to_string(),
            elapsed_ms: 12,
            fallback_used: false,
            attempts: vec![providers::ProviderAttempt {
                provider: provider.to_string(),
                elapsed_ms: 12,
                fallback_used: false,
                error_kind: None,
                error_message: None,
            }],
        }
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_session(
                "s1",
                vec!["唐揚げ".to_string(), "味噌ラーメン".to_string()],
                serde_json::json!({}),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn duplicate_session_id_conflicts() {
        let store = seeded_store().await;
        let result = store
            .create_session("s1", vec!["抹茶アイス".to_string()], serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn creation_appends_started_and_item_events() {
        let store = seeded_store().await;
        let events = store.events_after("s1", 0).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            [
                crate::types::EventType::SessionStarted,
                crate::types::EventType::ItemCreated,
                crate::types::EventType::ItemCreated,
            ],
        );
        let ids: Vec<_> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, [1, 2, 3]);
    }

    #[tokio::test]
    async fn duplicate_success_is_one_transition_two_audit_rows() {
        let store = seeded_store().await;
        store
            .mark_stage_processing("s1", 0, Stage::Translation)
            .await
            .unwrap();

        let payload = StagePayload::Translation {
            english: "Fried Chicken".to_string(),
            category: "Main".to_string(),
        };
        let first = store
            .record_stage_success("s1", 0, Stage::Translation, payload.clone(), info("p"))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .record_stage_success("s1", 0, Stage::Translation, payload, info("p"))
            .await
            .unwrap();
        assert!(second.is_none());

        let item = store.get_item("s1", 0).await.unwrap();
        assert_eq!(item.english_text.as_deref(), Some("Fried Chicken"));
        assert_eq!(item.translation_status, StageStatus::Completed);

        let records = store.provider_records("s1").await.unwrap();
        assert_eq!(records.len(), 2);

        let completed_events = store
            .events_after("s1", 0)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == crate::types::EventType::StageCompleted)
            .count();
        assert_eq!(completed_events, 1);
    }

    #[tokio::test]
    async fn failure_after_success_is_sticky() {
        let store = seeded_store().await;
        let payload = StagePayload::Description {
            description: "Rich and savory.".to_string(),
        };
        store
            .record_stage_success("s1", 0, Stage::Description, payload, info("p"))
            .await
            .unwrap();

        let late_failure = store
            .record_stage_failure(
                "s1",
                0,
                Stage::Description,
                StageFailure::timed_out("too slow"),
                info("p"),
            )
            .await
            .unwrap();
        assert!(late_failure.is_none());

        let item = store.get_item("s1", 0).await.unwrap();
        assert_eq!(item.description_status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn image_status_merges_both_image_stages() {
        let store = seeded_store().await;
        store
            .record_stage_success(
                "s1",
                0,
                Stage::ImageSearch,
                StagePayload::ImageSearch {
                    images: vec![ImageRecord {
                        image_url: "https://example.com/a.jpg".to_string(),
                        storage_key: None,
                        prompt: None,
                        metadata: None,
                    }],
                },
                info("search"),
            )
            .await
            .unwrap();

        let item = store.get_item("s1", 0).await.unwrap();
        assert_eq!(item.image_status, StageStatus::Pending);

        store
            .record_stage_failure(
                "s1",
                0,
                Stage::ImageGen,
                StageFailure::timed_out("gen down"),
                info("gen"),
            )
            .await
            .unwrap();

        let item = store.get_item("s1", 0).await.unwrap();
        assert_eq!(item.image_status, StageStatus::Failed);
        assert_eq!(item.images.len(), 1);
    }

    #[tokio::test]
    async fn session_completes_only_when_all_stages_terminal() {
        let store = seeded_store().await;
        assert!(
            store
                .complete_session_if_done("s1")
                .await
                .unwrap()
                .is_none()
        );

        for item_id in 0..2 {
            for stage in Stage::iter() {
                store
                    .record_stage_failure(
                        "s1",
                        item_id,
                        stage,
                        StageFailure::timed_out("x"),
                        info("p"),
                    )
                    .await
                    .unwrap();
            }
        }

        let terminal = store.complete_session_if_done("s1").await.unwrap();
        let terminal = terminal.expect("session should complete");
        assert_eq!(terminal.payload["completed_count"], 2);
        assert_eq!(terminal.payload["failed_count"], 0);

        // Terminal sessions never revive.
        assert!(
            store
                .complete_session_if_done("s1")
                .await
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            store.cancel_session("s1").await,
            Err(StoreError::AlreadyTerminal(_)),
        ));
    }

    #[tokio::test]
    async fn cancel_marks_failed_and_reports_summary() {
        let store = seeded_store().await;
        let event = store.cancel_session("s1").await.unwrap();
        assert_eq!(event.payload["status"], "failed");
        assert_eq!(event.payload["completed_count"], 0);
        assert_eq!(event.payload["failed_count"], 2);

        let snapshot = store.get_session("s1").await.unwrap();
        assert_eq!(snapshot.session.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn events_replay_from_offset() {
        let store = seeded_store().await;
        store
            .mark_stage_processing("s1", 0, Stage::Translation)
            .await
            .unwrap();
        let all = store.events_after("s1", 0).await.unwrap();
        assert_eq!(all.len(), 4);
        let tail = store.events_after("s1", 2).await.unwrap();
        let ids: Vec<_> = tail.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, [3, 4]);
    }
}
