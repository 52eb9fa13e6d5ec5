//! Reconciliation sweep: fails stages stuck in `processing` past their
//! deadline (a worker died mid-stage, or a success was dropped after a
//! persistence failure) and prunes event-log rows past the replay TTL.

use crate::config::PipelineConfig;
use crate::sink::ResultSink;
use crate::workers::empty_provider_info;
use chrono::Utc;
use log::{info, warn};
use menulens_db::types::{Stage, StageFailure};
use strum::IntoEnumIterator;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) fn spawn_sweep(
    sink: ResultSink,
    config: PipelineConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.sweep_interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            run_sweep_once(&sink, &config).await;
        }
    })
}

/// One sweep pass. Public so tests can drive it without the timer.
pub async fn run_sweep_once(sink: &ResultSink, config: &PipelineConfig) {
    let store = sink.store().clone();

    for stage in Stage::iter() {
        // Twice the stage budget leaves room for the worker's own timeout
        // handling to land first; the sweep only catches what it missed.
        let grace = config.stage_timeout(stage) * 2;
        let grace = chrono::Duration::from_std(grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(240));
        let cutoff = Utc::now() - grace;

        let stuck = match store.stuck_stages(stage, cutoff).await {
            Ok(stuck) => stuck,
            Err(err) => {
                warn!("Sweep couldn't scan {stage} stages: {err}");
                continue;
            }
        };

        for entry in stuck {
            info!(
                "Sweep failing stuck stage {}/{}/{}",
                entry.session_id, entry.item_id, entry.stage,
            );
            sink.stage_failure(
                &entry.session_id,
                entry.item_id,
                entry.stage,
                StageFailure::timed_out("stage was stuck in processing past its deadline"),
                empty_provider_info(),
            )
            .await;
            sink.complete_session_if_done(&entry.session_id).await;
        }
    }

    let ttl_cutoff = Utc::now() - chrono::Duration::seconds(config.session_ttl_seconds as i64);
    match store.prune_events(ttl_cutoff).await {
        Ok(0) => {}
        Ok(pruned) => info!("Sweep pruned {pruned} expired event rows"),
        Err(err) => warn!("Sweep couldn't prune events: {err}"),
    }
}
