//! Accepts an OCR'd item list, fans each item out across the stage pools,
//! and watches the session's event stream to detect completion and to
//! release translation-gated stages.

use crate::app::StageChains;
use crate::bus::EventBus;
use crate::config::PipelineConfig;
use crate::sink::ResultSink;
use crate::task::{StageInputs, StageTask};
use crate::workers::{CancelledSessions, StagePool, empty_provider_info};
use enum_map::EnumMap;
use hashbrown::HashMap;
use log::{debug, error, warn};
use menulens_db::store::{SessionStore, StoreError};
use menulens_db::types::{EventRow, EventType, FailureKind, Session, Stage, StageFailure};
use miette::Diagnostic;
use std::sync::Arc;
use strum::IntoEnumIterator;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Error, Diagnostic)]
pub enum StartError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("the {stage} worker queue is saturated")]
    QueueFull { stage: Stage },

    #[error("no providers are configured for the {stage} stage")]
    ProviderUnavailable { stage: Stage },
}

pub struct Orchestrator {
    config: PipelineConfig,
    store: Arc<dyn SessionStore>,
    sink: ResultSink,
    bus: Arc<EventBus>,
    pools: EnumMap<Stage, StagePool>,
    chains: Arc<StageChains>,
    cancelled: Arc<CancelledSessions>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: PipelineConfig,
        store: Arc<dyn SessionStore>,
        sink: ResultSink,
        bus: Arc<EventBus>,
        pools: EnumMap<Stage, StagePool>,
        chains: Arc<StageChains>,
        cancelled: Arc<CancelledSessions>,
    ) -> Self {
        Self {
            config,
            store,
            sink,
            bus,
            pools,
            chains,
            cancelled,
        }
    }

    pub async fn start_session(
        &self,
        session_id: Option<String>,
        items: Vec<String>,
        metadata: serde_json::Value,
    ) -> Result<Session, StartError> {
        if items.is_empty() || items.len() > self.config.max_items_per_session {
            return Err(StartError::Validation(format!(
                "item count must be between 1 and {}, got {}",
                self.config.max_items_per_session,
                items.len(),
            )));
        }
        for (index, text) in items.iter().enumerate() {
            let length = text.chars().count();
            if length == 0 || length > self.config.max_item_text_length {
                return Err(StartError::Validation(format!(
                    "item {index} text length must be between 1 and {} characters, got {length}",
                    self.config.max_item_text_length,
                )));
            }
        }
        for stage in Stage::iter() {
            if self.chains.is_empty_for(stage) {
                return Err(StartError::ProviderUnavailable { stage });
            }
        }

        let session_id =
            session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (snapshot, events) = self
            .store
            .create_session(&session_id, items.clone(), metadata)
            .await?;

        let gated: Vec<Stage> = self
            .config
            .require_translation
            .iter()
            .copied()
            .filter(|stage| *stage != Stage::Translation)
            .collect();
        let mut deferred: HashMap<i32, Vec<Stage>> = HashMap::new();
        if !gated.is_empty() {
            for item_id in 0..items.len() as i32 {
                deferred.insert(item_id, gated.clone());
            }
        }

        let session_deadline = Instant::now() + self.config.session_budget();

        // The listener must be subscribed before any stage task can publish.
        self.spawn_session_listener(session_id.clone(), deferred, session_deadline);
        for event in events {
            self.sink.publish(event);
        }

        for (item_id, japanese_text) in items.iter().enumerate() {
            for stage in Stage::iter() {
                if gated.contains(&stage) {
                    continue;
                }
                let task = StageTask {
                    session_id: session_id.clone(),
                    item_id: item_id as i32,
                    stage,
                    inputs: StageInputs::from_japanese(japanese_text.clone()),
                    attempt: 0,
                    deadline: self.task_deadline(stage, session_deadline),
                };
                if let Err(err) = self.pools[stage]
                    .enqueue(task, self.config.enqueue_timeout())
                    .await
                {
                    warn!("Admission control rejected session {session_id}: {err}");
                    // Refuse the whole session rather than leave it half-fed:
                    // a never-enqueued stage would otherwise stay pending
                    // forever.
                    self.cancelled.mark(&session_id);
                    match self.store.cancel_session(&session_id).await {
                        Ok(event) => self.sink.publish(event),
                        Err(err) => error!("Couldn't cancel rejected session {session_id}: {err}"),
                    }
                    return Err(StartError::QueueFull { stage });
                }
            }
        }

        Ok(snapshot.session)
    }

    pub async fn cancel_session(&self, session_id: &str) -> Result<EventRow, StoreError> {
        let event = self.store.cancel_session(session_id).await?;
        // Queued tasks are filtered at dequeue; in-flight tasks run to their
        // deadline and may still record results.
        self.cancelled.mark(session_id);
        self.sink.publish(event.clone());
        Ok(event)
    }

    fn task_deadline(&self, stage: Stage, session_deadline: Instant) -> Instant {
        std::cmp::min(
            Instant::now() + self.config.stage_timeout(stage),
            session_deadline,
        )
    }

    fn spawn_session_listener(
        &self,
        session_id: String,
        mut deferred: HashMap<i32, Vec<Stage>>,
        session_deadline: Instant,
    ) {
        let mut receiver = self.bus.subscribe(&session_id);
        let sink = self.sink.clone();
        let store = self.store.clone();
        let bus = self.bus.clone();
        let pools = self.pools.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session {session_id} listener lagged by {skipped} events");
                        if sink.complete_session_if_done(&session_id).await {
                            break;
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match event.event_type {
                    EventType::SessionCompleted => break,
                    EventType::StageCompleted | EventType::StageFailed => {
                        if event.stage == Some(Stage::Translation) {
                            if let Some(item_id) = event.item_id {
                                if let Some(stages) = deferred.remove(&item_id) {
                                    release_deferred_stages(
                                        &session_id,
                                        item_id,
                                        stages,
                                        event.event_type == EventType::StageCompleted,
                                        &store,
                                        &sink,
                                        &pools,
                                        &config,
                                        session_deadline,
                                    )
                                    .await;
                                }
                            }
                        }
                        if sink.complete_session_if_done(&session_id).await {
                            break;
                        }
                    }
                    _ => {}
                }
            }

            bus.retire(&session_id);
            debug!("Session {session_id} listener exited");
        });
    }
}

/// Enqueues the translation-gated stages for one item now that its English
/// name is known, or fails them when translation itself failed.
#[allow(clippy::too_many_arguments)]
async fn release_deferred_stages(
    session_id: &str,
    item_id: i32,
    stages: Vec<Stage>,
    translation_succeeded: bool,
    store: &Arc<dyn SessionStore>,
    sink: &ResultSink,
    pools: &EnumMap<Stage, StagePool>,
    config: &PipelineConfig,
    session_deadline: Instant,
) {
    if !translation_succeeded {
        for stage in stages {
            sink.stage_failure(
                session_id,
                item_id,
                stage,
                StageFailure::new(
                    FailureKind::Upstream,
                    "translation failed and this stage requires the English name",
                ),
                empty_provider_info(),
            )
            .await;
        }
        return;
    }

    let item = match store.get_item(session_id, item_id).await {
        Ok(item) => item,
        Err(err) => {
            error!("Couldn't load item {session_id}/{item_id} for deferred stages: {err}");
            return;
        }
    };

    for stage in stages {
        let task = StageTask {
            session_id: session_id.to_string(),
            item_id,
            stage,
            inputs: StageInputs {
                japanese_text: item.japanese_text.clone(),
                english_text: item.english_text.clone(),
                category: item.category.clone(),
                description: item.description.clone(),
            },
            attempt: 0,
            deadline: std::cmp::min(
                Instant::now() + config.stage_timeout(stage),
                session_deadline,
            ),
        };
        if let Err(err) = pools[stage].enqueue(task, config.enqueue_timeout()).await {
            warn!("Couldn't enqueue deferred {stage} for {session_id}/{item_id}: {err}");
            sink.stage_failure(
                session_id,
                item_id,
                stage,
                StageFailure::new(FailureKind::Transient, format!("couldn't enqueue: {err}")),
                empty_provider_info(),
            )
            .await;
        }
    }
}
