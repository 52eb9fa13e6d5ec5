//! Scripted mock providers and fixture helpers shared by the scenario
//! tests.

use async_trait::async_trait;
use menulens_db::store::SessionStore;
use menulens_db::types::SessionSnapshot;
use menulens_pipeline::{PipelineConfig, StageChains};
use providers::{
    AllergenProvider, Chain, DescriptionProvider, ErrorKind, FoundImage, GeneratedImage,
    Identified, ImageGenProvider, ImageSearchProvider, IngredientProvider, ProviderError,
    RetryPolicy, Translation, TranslationProvider,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Scripted behavior for a mock provider: fail N times, stay down, hang, or
/// answer after a fixed delay.
#[derive(Default)]
pub struct Script {
    pub fail_times: u32,
    pub error_kind: Option<ErrorKind>,
    pub always_fail: bool,
    pub hang: bool,
    pub delay: Duration,
    calls: AtomicU32,
}

impl Script {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn down(kind: ErrorKind) -> Self {
        Self {
            always_fail: true,
            error_kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn flaky(fail_times: u32, kind: ErrorKind) -> Self {
        Self {
            fail_times,
            error_kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn gate(&self, provider: &str) -> Result<(), ProviderError> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let kind = self.error_kind.unwrap_or(ErrorKind::Transient);
        if self.always_fail {
            return Err(ProviderError::new(kind, provider, "scripted outage"));
        }
        if call < self.fail_times {
            return Err(ProviderError::new(kind, provider, "scripted failure"));
        }
        Ok(())
    }
}

pub struct MockTranslate {
    pub name: &'static str,
    pub script: Script,
}

impl Identified for MockTranslate {
    fn id(&self) -> &'static str {
        self.name
    }
}

#[async_trait]
impl TranslationProvider for MockTranslate {
    async fn translate(&self, japanese: &str) -> Result<Translation, ProviderError> {
        self.script.gate(self.name).await?;
        Ok(Translation {
            english: format!("{japanese} (en)"),
            category: "Main".to_string(),
        })
    }
}

pub struct MockDescribe {
    pub name: &'static str,
    pub script: Script,
}

impl Identified for MockDescribe {
    fn id(&self) -> &'static str {
        self.name
    }
}

#[async_trait]
impl DescriptionProvider for MockDescribe {
    async fn describe(
        &self,
        japanese: &str,
        _english: Option<&str>,
        _category: Option<&str>,
    ) -> Result<String, ProviderError> {
        self.script.gate(self.name).await?;
        Ok(format!("A classic dish: {japanese}."))
    }
}

pub struct MockAllergens {
    pub name: &'static str,
    pub script: Script,
    /// When set, calls without an English name fail permanently. Used to
    /// prove translation gating delivered the English inputs.
    pub require_english: bool,
}

impl Identified for MockAllergens {
    fn id(&self) -> &'static str {
        self.name
    }
}

#[async_trait]
impl AllergenProvider for MockAllergens {
    async fn allergens(
        &self,
        _japanese: &str,
        english: Option<&str>,
    ) -> Result<Vec<String>, ProviderError> {
        self.script.gate(self.name).await?;
        if self.require_english && english.is_none() {
            return Err(ProviderError::new(
                ErrorKind::Permanent,
                self.name,
                "this provider needs the English name",
            ));
        }
        Ok(vec!["soy".to_string(), "wheat".to_string()])
    }
}

pub struct MockIngredients {
    pub name: &'static str,
    pub script: Script,
}

impl Identified for MockIngredients {
    fn id(&self) -> &'static str {
        self.name
    }
}

#[async_trait]
impl IngredientProvider for MockIngredients {
    async fn ingredients(
        &self,
        _japanese: &str,
        _english: Option<&str>,
    ) -> Result<Vec<String>, ProviderError> {
        self.script.gate(self.name).await?;
        Ok(vec!["chicken".to_string(), "rice".to_string()])
    }
}

pub struct MockImageSearch {
    pub name: &'static str,
    pub script: Script,
}

impl Identified for MockImageSearch {
    fn id(&self) -> &'static str {
        self.name
    }
}

#[async_trait]
impl ImageSearchProvider for MockImageSearch {
    async fn search(
        &self,
        japanese: &str,
        _english: Option<&str>,
    ) -> Result<Vec<FoundImage>, ProviderError> {
        self.script.gate(self.name).await?;
        Ok((0..3)
            .map(|n| FoundImage {
                url: format!("https://images.example.com/{japanese}/{n}.jpg"),
                source_page: None,
                thumbnail_url: None,
                width: Some(800),
                height: Some(600),
            })
            .collect())
    }
}

pub struct MockImageGen {
    pub name: &'static str,
    pub script: Script,
}

impl Identified for MockImageGen {
    fn id(&self) -> &'static str {
        self.name
    }
}

#[async_trait]
impl ImageGenProvider for MockImageGen {
    async fn generate(
        &self,
        japanese: &str,
        _english: Option<&str>,
        _description: Option<&str>,
    ) -> Result<GeneratedImage, ProviderError> {
        self.script.gate(self.name).await?;
        Ok(GeneratedImage {
            url: format!("https://gen.example.com/{japanese}.png"),
            storage_key: Some(format!("generated/{japanese}.png")),
            prompt: format!("A photo of {japanese}"),
        })
    }
}

pub fn test_policy() -> RetryPolicy {
    RetryPolicy {
        retries_per_provider: 2,
        initial_backoff: Duration::from_millis(1),
        call_timeout: Duration::from_secs(5),
    }
}

/// All six stages answered by well-behaved mocks.
pub fn happy_chains() -> StageChains {
    StageChains {
        translation: Chain::new(
            vec![Arc::new(MockTranslate {
                name: "mock_translate",
                script: Script::ok(),
            })],
            test_policy(),
        ),
        description: Chain::new(
            vec![Arc::new(MockDescribe {
                name: "mock_describe",
                script: Script::ok(),
            })],
            test_policy(),
        ),
        allergen: Chain::new(
            vec![Arc::new(MockAllergens {
                name: "mock_allergens",
                script: Script::ok(),
                require_english: false,
            })],
            test_policy(),
        ),
        ingredient: Chain::new(
            vec![Arc::new(MockIngredients {
                name: "mock_ingredients",
                script: Script::ok(),
            })],
            test_policy(),
        ),
        image_search: Chain::new(
            vec![Arc::new(MockImageSearch {
                name: "mock_image_search",
                script: Script::ok(),
            })],
            test_policy(),
        ),
        image_gen: Chain::new(
            vec![Arc::new(MockImageGen {
                name: "mock_image_gen",
                script: Script::ok(),
            })],
            test_policy(),
        ),
    }
}

/// Fast timeouts and retries so scenarios finish in milliseconds.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.session_budget_ms = 10_000;
    config.worker_retry_delay_ms = 5;
    config.enqueue_timeout_ms = 200;
    config.sweep_interval_seconds = 3600;
    for pool in [
        &mut config.translation,
        &mut config.description,
        &mut config.allergen,
        &mut config.ingredient,
        &mut config.image_search,
        &mut config.image_gen,
    ] {
        pool.timeout_ms = 2_000;
        pool.queue_capacity = 1024;
    }
    config
}

pub async fn wait_for_terminal(
    store: &Arc<dyn SessionStore>,
    session_id: &str,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = store
                .get_session(session_id)
                .await
                .expect("session should exist");
            if snapshot.session.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session did not reach a terminal state in time")
}
