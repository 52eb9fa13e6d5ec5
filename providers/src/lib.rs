mod chain;
mod error;

pub mod google;
pub mod openai;

pub use chain::{Chain, ChainOutcome, ProviderAttempt, RetryPolicy};
pub use error::{ErrorKind, ProviderError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Every provider knows its stable identifier, which is what configuration
/// files use to build chains and what audit records store.
pub trait Identified {
    fn id(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Translation {
    pub english: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundImage {
    pub url: String,
    pub source_page: Option<String>,
    pub thumbnail_url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    pub storage_key: Option<String>,
    pub prompt: String,
}

/// Translate a dish name and assign it a coarse menu category.
#[async_trait]
pub trait TranslationProvider: Identified + Send + Sync {
    async fn translate(&self, japanese: &str) -> Result<Translation, ProviderError>;
}

/// Produce a long-form description of a dish. English name and category are
/// passed along when translation has already finished, but providers must
/// cope with the Japanese name alone.
#[async_trait]
pub trait DescriptionProvider: Identified + Send + Sync {
    async fn describe(
        &self,
        japanese: &str,
        english: Option<&str>,
        category: Option<&str>,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait AllergenProvider: Identified + Send + Sync {
    async fn allergens(
        &self,
        japanese: &str,
        english: Option<&str>,
    ) -> Result<Vec<String>, ProviderError>;
}

#[async_trait]
pub trait IngredientProvider: Identified + Send + Sync {
    async fn ingredients(
        &self,
        japanese: &str,
        english: Option<&str>,
    ) -> Result<Vec<String>, ProviderError>;
}

#[async_trait]
pub trait ImageSearchProvider: Identified + Send + Sync {
    async fn search(
        &self,
        japanese: &str,
        english: Option<&str>,
    ) -> Result<Vec<FoundImage>, ProviderError>;
}

#[async_trait]
pub trait ImageGenProvider: Identified + Send + Sync {
    async fn generate(
        &self,
        japanese: &str,
        english: Option<&str>,
        description: Option<&str>,
    ) -> Result<GeneratedImage, ProviderError>;
}

pub type TranslationChain = Chain<dyn TranslationProvider>;
pub type DescriptionChain = Chain<dyn DescriptionProvider>;
pub type AllergenChain = Chain<dyn AllergenProvider>;
pub type IngredientChain = Chain<dyn IngredientProvider>;
pub type ImageSearchChain = Chain<dyn ImageSearchProvider>;
pub type ImageGenChain = Chain<dyn ImageGenProvider>;
