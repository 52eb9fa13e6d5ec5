use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use menulens_db::types::Stage;
use providers::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StagePoolConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub timeout_ms: u64,
}

impl StagePoolConfig {
    fn new(concurrency: usize, timeout_ms: u64) -> Self {
        Self {
            concurrency,
            queue_capacity: 256,
            timeout_ms,
        }
    }
}

/// Ordered provider identifiers per stage, primary first. Bound to concrete
/// implementations at startup.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderChainConfig {
    pub translation: Vec<String>,
    pub description: Vec<String>,
    pub allergen: Vec<String>,
    pub ingredient: Vec<String>,
    pub image_search: Vec<String>,
    pub image_gen: Vec<String>,
}

impl Default for ProviderChainConfig {
    fn default() -> Self {
        Self {
            translation: vec!["openai_translate".to_string()],
            description: vec!["openai_describe".to_string()],
            allergen: vec!["openai_allergens".to_string()],
            ingredient: vec!["openai_ingredients".to_string()],
            image_search: vec!["google_image_search".to_string()],
            image_gen: vec!["openai_image_gen".to_string()],
        }
    }
}

impl ProviderChainConfig {
    pub fn for_stage(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::Translation => &self.translation,
            Stage::Description => &self.description,
            Stage::Allergen => &self.allergen,
            Stage::Ingredient => &self.ingredient,
            Stage::ImageSearch => &self.image_search,
            Stage::ImageGen => &self.image_gen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub max_items_per_session: usize,
    pub max_item_text_length: usize,
    pub session_budget_ms: u64,
    pub session_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub enqueue_timeout_ms: u64,
    pub worker_retry_delay_ms: u64,
    pub event_channel_capacity: usize,
    pub heartbeat_interval_seconds: u64,
    pub db_pool_size: u32,
    pub auto_reset_database: bool,
    /// Stages that must wait for the item's translation before being
    /// enqueued. Empty by default; set it when a deployment's providers
    /// need the English name.
    pub require_translation: Vec<Stage>,
    pub provider_retries: u32,
    pub provider_backoff_ms: u64,
    pub translation: StagePoolConfig,
    pub description: StagePoolConfig,
    pub allergen: StagePoolConfig,
    pub ingredient: StagePoolConfig,
    pub image_search: StagePoolConfig,
    pub image_gen: StagePoolConfig,
    pub provider_chain: ProviderChainConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_items_per_session: 200,
            max_item_text_length: 500,
            session_budget_ms: 300_000,
            session_ttl_seconds: 3600,
            sweep_interval_seconds: 30,
            enqueue_timeout_ms: 5_000,
            worker_retry_delay_ms: 1_000,
            event_channel_capacity: 256,
            heartbeat_interval_seconds: 15,
            db_pool_size: 20,
            auto_reset_database: false,
            require_translation: Vec::new(),
            provider_retries: 2,
            provider_backoff_ms: 500,
            translation: StagePoolConfig::new(8, 60_000),
            description: StagePoolConfig::new(6, 60_000),
            allergen: StagePoolConfig::new(6, 60_000),
            ingredient: StagePoolConfig::new(6, 60_000),
            image_search: StagePoolConfig::new(4, 120_000),
            image_gen: StagePoolConfig::new(3, 120_000),
            provider_chain: ProviderChainConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("Menulens.toml"))
            .merge(Env::prefixed("MENULENS_"))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }

    pub fn stage_pool(&self, stage: Stage) -> &StagePoolConfig {
        match stage {
            Stage::Translation => &self.translation,
            Stage::Description => &self.description,
            Stage::Allergen => &self.allergen,
            Stage::Ingredient => &self.ingredient,
            Stage::ImageSearch => &self.image_search,
            Stage::ImageGen => &self.image_gen,
        }
    }

    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        Duration::from_millis(self.stage_pool(stage).timeout_ms)
    }

    pub fn session_budget(&self) -> Duration {
        Duration::from_millis(self.session_budget_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn worker_retry_delay(&self) -> Duration {
        Duration::from_millis(self.worker_retry_delay_ms)
    }

    /// The adapter-level retry policy for one stage's chain. The per-call
    /// timeout matches the stage budget; the worker enforces the overall
    /// deadline on top.
    pub fn retry_policy(&self, stage: Stage) -> RetryPolicy {
        RetryPolicy {
            retries_per_provider: self.provider_retries,
            initial_backoff: Duration::from_millis(self.provider_backoff_ms),
            call_timeout: self.stage_timeout(stage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_pool_sizes() {
        let config = PipelineConfig::default();
        assert_eq!(config.translation.concurrency, 8);
        assert_eq!(config.description.concurrency, 6);
        assert_eq!(config.image_search.concurrency, 4);
        assert_eq!(config.image_gen.concurrency, 3);
        assert_eq!(config.stage_timeout(Stage::Translation).as_secs(), 60);
        assert_eq!(config.stage_timeout(Stage::ImageGen).as_secs(), 120);
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let config: PipelineConfig = Figment::from(Serialized::defaults(PipelineConfig::default()))
            .merge(("max_items_per_session", 50))
            .merge(("image_gen.concurrency", 1))
            .extract()
            .expect("config should parse");
        assert_eq!(config.max_items_per_session, 50);
        assert_eq!(config.image_gen.concurrency, 1);
        // Untouched keys keep their defaults.
        assert_eq!(config.max_item_text_length, 500);
    }
}
