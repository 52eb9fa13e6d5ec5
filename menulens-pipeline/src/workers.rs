//! Stage worker pools: one bounded queue and a fixed set of workers per
//! stage kind. Workers pull FIFO, drive the stage's provider chain under the
//! task deadline, and hand every outcome to the result sink.

use crate::app::StageChains;
use crate::sink::ResultSink;
use crate::task::StageTask;
use futures::FutureExt;
use log::{debug, info, warn};
use menulens_db::types::{
    FailureKind, ImageRecord, ProviderInfo, Stage, StageFailure, StagePayload,
};
use providers::{ChainOutcome, ProviderAttempt, ProviderError};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sessions whose queued tasks are dropped at dequeue time. Tasks already
/// being worked run to their deadline.
#[derive(Default)]
pub struct CancelledSessions(RwLock<HashSet<String>>);

impl CancelledSessions {
    pub fn mark(&self, session_id: &str) {
        self.0
            .write()
            .expect("cancelled set lock poisoned")
            .insert(session_id.to_string());
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.0
            .read()
            .expect("cancelled set lock poisoned")
            .contains(session_id)
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("the {0} queue is full")]
    QueueFull(Stage),

    #[error("the {0} pool has shut down")]
    Closed(Stage),
}

/// Handle for enqueuing tasks onto one stage's bounded queue.
#[derive(Clone)]
pub struct StagePool {
    stage: Stage,
    sender: mpsc::Sender<StageTask>,
}

impl StagePool {
    /// Blocks up to `timeout` for queue space, then reports saturation as a
    /// typed error. Work is never silently dropped.
    pub async fn enqueue(&self, task: StageTask, timeout: Duration) -> Result<(), EnqueueError> {
        use tokio::sync::mpsc::error::SendTimeoutError;

        match self.sender.send_timeout(task, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(EnqueueError::QueueFull(self.stage)),
            Err(SendTimeoutError::Closed(_)) => Err(EnqueueError::Closed(self.stage)),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub sink: ResultSink,
    pub chains: Arc<StageChains>,
    pub cancelled: Arc<CancelledSessions>,
    pub retry_delay: Duration,
}

pub(crate) fn spawn_stage_pool(
    stage: Stage,
    concurrency: usize,
    queue_capacity: usize,
    ctx: WorkerContext,
    shutdown: CancellationToken,
) -> (StagePool, Vec<JoinHandle<()>>) {
    let (sender, receiver) = mpsc::channel::<StageTask>(queue_capacity.max(1));
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

    let handles = (0..concurrency.max(1))
        .map(|worker_id| {
            let receiver = receiver.clone();
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_loop(stage, worker_id, receiver, ctx, shutdown).await;
            })
        })
        .collect();

    info!("Launched {concurrency} {stage} workers");
    (StagePool { stage, sender }, handles)
}

async fn worker_loop(
    stage: Stage,
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<StageTask>>>,
    ctx: WorkerContext,
    shutdown: CancellationToken,
) {
    loop {
        // Hold the receiver lock only while waiting for the next task, so a
        // busy worker never blocks its siblings from picking up work.
        let task = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                task = receiver.recv() => task,
                _ = shutdown.cancelled() => None,
            }
        };
        let Some(task) = task else {
            debug!("{stage} worker {worker_id} is exiting");
            break;
        };

        if ctx.cancelled.contains(&task.session_id) {
            debug!(
                "{stage} worker {worker_id} dropping task for cancelled session {}",
                task.session_id,
            );
            continue;
        }

        handle_task(task, &ctx, worker_id).await;
    }
}

enum TaskOutcome {
    Success(StagePayload, ProviderInfo),
    Failed(ProviderError, ProviderInfo),
    TimedOut,
}

async fn handle_task(task: StageTask, ctx: &WorkerContext, worker_id: usize) {
    let stage = task.stage;
    debug!(
        "{stage} worker {worker_id} starting {}/{}",
        task.session_id, task.item_id,
    );

    let started = Instant::now();
    if task.deadline <= started {
        ctx.sink
            .stage_failure(
                &task.session_id,
                task.item_id,
                stage,
                StageFailure::timed_out("deadline passed before a worker picked the task up"),
                empty_provider_info(),
            )
            .await;
        return;
    }

    ctx.sink
        .stage_processing(&task.session_id, task.item_id, stage)
        .await;

    let mut all_attempts: Vec<ProviderAttempt> = Vec::new();
    let mut worker_attempt = 0u32;
    let outcome = loop {
        let remaining = task.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break TaskOutcome::TimedOut;
        }

        match tokio::time::timeout(remaining, invoke_stage(&task, &ctx.chains)).await {
            Err(_) => break TaskOutcome::TimedOut,
            Ok((result, info)) => {
                all_attempts.extend(info.attempts.iter().cloned());
                match result {
                    Ok(payload) => break TaskOutcome::Success(payload, info),
                    Err(err) if err.kind.is_retriable() && worker_attempt == 0 => {
                        // The adapter exhausted its own budget; give the
                        // whole chain one more pass after a fixed delay.
                        worker_attempt += 1;
                        info!(
                            "{stage} worker {worker_id} retrying {}/{} after {err}",
                            task.session_id, task.item_id,
                        );
                        tokio::time::sleep(ctx.retry_delay).await;
                    }
                    Err(err) => break TaskOutcome::Failed(err, info),
                }
            }
        }
    };

    match outcome {
        TaskOutcome::Success(payload, mut info) => {
            info.attempts = all_attempts;
            ctx.sink
                .stage_success(&task.session_id, task.item_id, stage, payload, info)
                .await;
        }
        TaskOutcome::Failed(err, mut info) => {
            info.attempts = all_attempts;
            let failure = StageFailure::new(FailureKind::from(err.kind), err.message);
            ctx.sink
                .stage_failure(&task.session_id, task.item_id, stage, failure, info)
                .await;
        }
        TaskOutcome::TimedOut => {
            warn!(
                "{stage} worker {worker_id} timed out on {}/{}",
                task.session_id, task.item_id,
            );
            let info = ProviderInfo {
                provider: String::new(),
                elapsed_ms: started.elapsed().as_millis() as i64,
                fallback_used: false,
                attempts: all_attempts,
            };
            ctx.sink
                .stage_failure(
                    &task.session_id,
                    task.item_id,
                    stage,
                    StageFailure::timed_out("provider call exceeded the stage deadline"),
                    info,
                )
                .await;
        }
    }
}

pub(crate) fn empty_provider_info() -> ProviderInfo {
    ProviderInfo {
        provider: String::new(),
        elapsed_ms: 0,
        fallback_used: false,
        attempts: Vec::new(),
    }
}

fn outcome_info<T>(outcome: &ChainOutcome<T>) -> ProviderInfo {
    ProviderInfo {
        provider: outcome.provider.clone(),
        elapsed_ms: outcome.elapsed_ms,
        fallback_used: outcome.fallback_used,
        attempts: outcome.attempts.clone(),
    }
}

fn found_image_to_record(image: providers::FoundImage) -> ImageRecord {
    let metadata = serde_json::json!({
        "source_page": image.source_page,
        "thumbnail_url": image.thumbnail_url,
        "width": image.width,
        "height": image.height,
    });
    ImageRecord {
        image_url: image.url,
        storage_key: None,
        prompt: None,
        metadata: Some(metadata),
    }
}

/// Runs the right provider chain for the task's stage and normalizes the
/// result into a persistable payload.
async fn invoke_stage(
    task: &StageTask,
    chains: &StageChains,
) -> (Result<StagePayload, ProviderError>, ProviderInfo) {
    let inputs = &task.inputs;
    match task.stage {
        Stage::Translation => {
            let japanese = inputs.japanese_text.clone();
            let outcome = chains
                .translation
                .invoke(move |p| {
                    let japanese = japanese.clone();
                    async move { p.translate(&japanese).await }.boxed()
                })
                .await;
            let info = outcome_info(&outcome);
            let result = outcome.result.map(|t| StagePayload::Translation {
                english: t.english,
                category: t.category,
            });
            (result, info)
        }
        Stage::Description => {
            let japanese = inputs.japanese_text.clone();
            let english = inputs.english_text.clone();
            let category = inputs.category.clone();
            let outcome = chains
                .description
                .invoke(move |p| {
                    let japanese = japanese.clone();
                    let english = english.clone();
                    let category = category.clone();
                    async move {
                        p.describe(&japanese, english.as_deref(), category.as_deref())
                            .await
                    }
                    .boxed()
                })
                .await;
            let info = outcome_info(&outcome);
            let result = outcome
                .result
                .map(|description| StagePayload::Description { description });
            (result, info)
        }
        Stage::Allergen => {
            let japanese = inputs.japanese_text.clone();
            let english = inputs.english_text.clone();
            let outcome = chains
                .allergen
                .invoke(move |p| {
                    let japanese = japanese.clone();
                    let english = english.clone();
                    async move { p.allergens(&japanese, english.as_deref()).await }.boxed()
                })
                .await;
            let info = outcome_info(&outcome);
            let result = outcome
                .result
                .map(|allergens| StagePayload::Allergens { allergens });
            (result, info)
        }
        Stage::Ingredient => {
            let japanese = inputs.japanese_text.clone();
            let english = inputs.english_text.clone();
            let outcome = chains
                .ingredient
                .invoke(move |p| {
                    let japanese = japanese.clone();
                    let english = english.clone();
                    async move { p.ingredients(&japanese, english.as_deref()).await }.boxed()
                })
                .await;
            let info = outcome_info(&outcome);
            let result = outcome
                .result
                .map(|ingredients| StagePayload::Ingredients { ingredients });
            (result, info)
        }
        Stage::ImageSearch => {
            let japanese = inputs.japanese_text.clone();
            let english = inputs.english_text.clone();
            let outcome = chains
                .image_search
                .invoke(move |p| {
                    let japanese = japanese.clone();
                    let english = english.clone();
                    async move { p.search(&japanese, english.as_deref()).await }.boxed()
                })
                .await;
            let info = outcome_info(&outcome);
            let provider = info.provider.clone();
            let result = outcome.result.and_then(|images| {
                if images.is_empty() {
                    Err(ProviderError::malformed(
                        &provider,
                        "search returned no images",
                    ))
                } else {
                    Ok(StagePayload::ImageSearch {
                        images: images.into_iter().map(found_image_to_record).collect(),
                    })
                }
            });
            (result, info)
        }
        Stage::ImageGen => {
            let japanese = inputs.japanese_text.clone();
            let english = inputs.english_text.clone();
            let description = inputs.description.clone();
            let outcome = chains
                .image_gen
                .invoke(move |p| {
                    let japanese = japanese.clone();
                    let english = english.clone();
                    let description = description.clone();
                    async move {
                        p.generate(&japanese, english.as_deref(), description.as_deref())
                            .await
                    }
                    .boxed()
                })
                .await;
            let info = outcome_info(&outcome);
            let result = outcome.result.map(|image| StagePayload::ImageGen {
                image: ImageRecord {
                    image_url: image.url,
                    storage_key: image.storage_key,
                    prompt: Some(image.prompt),
                    metadata: None,
                },
            });
            (result, info)
        }
    }
}
