//! The application value: owns the store handle, event bus, result sink,
//! stage pools, orchestrator, and the sweep. Built once at startup and
//! threaded through handlers by argument.

use crate::bus::EventBus;
use crate::config::PipelineConfig;
use crate::orchestrator::Orchestrator;
use crate::sink::ResultSink;
use crate::sweep;
use crate::workers::{CancelledSessions, StagePool, WorkerContext, spawn_stage_pool};
use enum_map::{EnumMap, enum_map};
use menulens_db::store::SessionStore;
use menulens_db::types::Stage;
use providers::{
    AllergenChain, DescriptionChain, ImageGenChain, ImageSearchChain, IngredientChain,
    TranslationChain,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The provider table: one bound chain per stage kind, primary first.
pub struct StageChains {
    pub translation: TranslationChain,
    pub description: DescriptionChain,
    pub allergen: AllergenChain,
    pub ingredient: IngredientChain,
    pub image_search: ImageSearchChain,
    pub image_gen: ImageGenChain,
}

impl StageChains {
    pub fn is_empty_for(&self, stage: Stage) -> bool {
        match stage {
            Stage::Translation => self.translation.is_empty(),
            Stage::Description => self.description.is_empty(),
            Stage::Allergen => self.allergen.is_empty(),
            Stage::Ingredient => self.ingredient.is_empty(),
            Stage::ImageSearch => self.image_search.is_empty(),
            Stage::ImageGen => self.image_gen.is_empty(),
        }
    }
}

pub struct Application {
    config: PipelineConfig,
    store: Arc<dyn SessionStore>,
    bus: Arc<EventBus>,
    sink: ResultSink,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    sweep_handle: JoinHandle<()>,
}

impl Application {
    /// Spawns the stage pools and the sweep. Must run inside a tokio
    /// runtime.
    pub fn start(
        config: PipelineConfig,
        store: Arc<dyn SessionStore>,
        chains: StageChains,
    ) -> Application {
        let bus = Arc::new(EventBus::new(config.event_channel_capacity.max(16)));
        let sink = ResultSink::new(store.clone(), bus.clone());
        let chains = Arc::new(chains);
        let cancelled = Arc::new(CancelledSessions::default());
        let shutdown = CancellationToken::new();

        let ctx = WorkerContext {
            sink: sink.clone(),
            chains: chains.clone(),
            cancelled: cancelled.clone(),
            retry_delay: config.worker_retry_delay(),
        };

        let mut worker_handles = Vec::new();
        let pools: EnumMap<Stage, StagePool> = enum_map! {
            stage => {
                let pool_config = config.stage_pool(stage);
                let (pool, handles) = spawn_stage_pool(
                    stage,
                    pool_config.concurrency,
                    pool_config.queue_capacity,
                    ctx.clone(),
                    shutdown.clone(),
                );
                worker_handles.extend(handles);
                pool
            }
        };

        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            store.clone(),
            sink.clone(),
            bus.clone(),
            pools,
            chains,
            cancelled,
        ));
        let sweep_handle = sweep::spawn_sweep(sink.clone(), config.clone(), shutdown.clone());

        Application {
            config,
            store,
            bus,
            sink,
            orchestrator,
            shutdown,
            worker_handles,
            sweep_handle,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Stops the workers and the sweep. In-flight provider calls are
    /// abandoned; their stages are recovered by the next deployment's sweep.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.worker_handles {
            let _ = handle.await;
        }
        let _ = self.sweep_handle.await;
    }
}
