//! The single write path from workers into persistence and out onto the
//! event bus. Persist first, publish second; if persistence ultimately
//! fails the event is dropped and the reconciliation sweep picks the stage
//! back up from its persisted `processing` state.

use crate::bus::EventBus;
use log::{error, warn};
use menulens_db::store::{SessionStore, StoreError};
use menulens_db::types::{EventRow, ProviderInfo, Stage, StageFailure, StagePayload};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ResultSink {
    store: Arc<dyn SessionStore>,
    bus: Arc<EventBus>,
    persist_retries: u32,
    retry_delay: Duration,
}

impl ResultSink {
    pub fn new(store: Arc<dyn SessionStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            persist_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn publish(&self, event: EventRow) {
        self.bus.publish(Arc::new(event));
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < self.persist_retries => {
                    attempt += 1;
                    warn!("Transient store error (attempt {attempt}): {err}");
                    tokio::time::sleep(self.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    /// Marks a stage `processing` and publishes the transition. A no-op when
    /// the stage already left `pending`.
    pub async fn stage_processing(&self, session_id: &str, item_id: i32, stage: Stage) {
        let result = self
            .with_retries(|| self.store.mark_stage_processing(session_id, item_id, stage))
            .await;
        match result {
            Ok(Some(event)) => self.publish(event),
            Ok(None) => {}
            Err(err) => {
                error!("Couldn't mark {session_id}/{item_id}/{stage} processing: {err}");
            }
        }
    }

    pub async fn stage_success(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
        payload: StagePayload,
        info: ProviderInfo,
    ) {
        let result = self
            .with_retries(|| {
                self.store.record_stage_success(
                    session_id,
                    item_id,
                    stage,
                    payload.clone(),
                    info.clone(),
                )
            })
            .await;
        match result {
            Ok(Some(event)) => self.publish(event),
            Ok(None) => {}
            Err(err) => {
                // The stage stays `processing` in the store; the sweep will
                // eventually fail it and emit the corresponding event.
                error!("Dropping success for {session_id}/{item_id}/{stage}: {err}");
            }
        }
    }

    pub async fn stage_failure(
        &self,
        session_id: &str,
        item_id: i32,
        stage: Stage,
        failure: StageFailure,
        info: ProviderInfo,
    ) {
        let result = self
            .with_retries(|| {
                self.store.record_stage_failure(
                    session_id,
                    item_id,
                    stage,
                    failure.clone(),
                    info.clone(),
                )
            })
            .await;
        match result {
            Ok(Some(event)) => self.publish(event),
            Ok(None) => {}
            Err(err) => {
                error!("Dropping failure for {session_id}/{item_id}/{stage}: {err}");
            }
        }
    }

    /// Runs the atomic completion check; publishes and reports true when this
    /// call was the one that completed the session.
    pub async fn complete_session_if_done(&self, session_id: &str) -> bool {
        let result = self
            .with_retries(|| self.store.complete_session_if_done(session_id))
            .await;
        match result {
            Ok(Some(event)) => {
                self.publish(event);
                true
            }
            Ok(None) => false,
            Err(err) => {
                error!("Completion check for {session_id} failed: {err}");
                false
            }
        }
    }
}
