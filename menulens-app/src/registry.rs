//! Binds provider identifier strings from configuration to constructed
//! implementations, once at startup. An unknown identifier or an empty
//! chain refuses to boot.

use menulens_db::types::Stage;
use menulens_pipeline::{PipelineConfig, StageChains};
use miette::Diagnostic;
use providers::google::GoogleImageSearch;
use providers::openai::{
    OpenAiAllergens, OpenAiChat, OpenAiConfig, OpenAiDescribe, OpenAiImageGen, OpenAiIngredients,
    OpenAiTranslate,
};
use providers::{
    AllergenProvider, Chain, DescriptionProvider, ImageGenProvider, ImageSearchProvider,
    IngredientProvider, TranslationProvider,
};
use std::sync::Arc;
use thiserror::Error;

const IMAGE_SEARCH_RESULTS: u8 = 5;

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("unknown provider identifier {0:?} for the {1} stage")]
    UnknownProvider(String, Stage),

    #[error("provider {0:?} requires {1} to be set")]
    MissingCredential(&'static str, &'static str),

    #[error("no providers configured for the {0} stage")]
    EmptyChain(Stage),
}

struct ProviderFactory {
    chat: Option<OpenAiChat>,
    openai_config: Option<OpenAiConfig>,
    google: Option<(String, String)>,
}

impl ProviderFactory {
    fn from_env() -> Self {
        let openai_config = std::env::var("OPENAI_API_KEY").ok().map(|api_key| {
            let mut config = OpenAiConfig::new(api_key);
            if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
                config.base_url = base_url;
            }
            if let Ok(model) = std::env::var("OPENAI_MODEL") {
                config.model = model;
            }
            if let Ok(image_model) = std::env::var("OPENAI_IMAGE_MODEL") {
                config.image_model = image_model;
            }
            config
        });
        let chat = openai_config.clone().map(OpenAiChat::new);
        let google = match (
            std::env::var("GOOGLE_API_KEY"),
            std::env::var("GOOGLE_CSE_ID"),
        ) {
            (Ok(api_key), Ok(cse_id)) => Some((api_key, cse_id)),
            _ => None,
        };
        Self {
            chat,
            openai_config,
            google,
        }
    }

    fn chat(&self, id: &'static str) -> Result<OpenAiChat, RegistryError> {
        self.chat
            .clone()
            .ok_or(RegistryError::MissingCredential(id, "OPENAI_API_KEY"))
    }

    fn openai_config(&self, id: &'static str) -> Result<OpenAiConfig, RegistryError> {
        self.openai_config
            .clone()
            .ok_or(RegistryError::MissingCredential(id, "OPENAI_API_KEY"))
    }

    fn google(&self, id: &'static str) -> Result<(String, String), RegistryError> {
        self.google.clone().ok_or(RegistryError::MissingCredential(
            id,
            "GOOGLE_API_KEY and GOOGLE_CSE_ID",
        ))
    }

    fn translation(&self, id: &str) -> Result<Arc<dyn TranslationProvider>, RegistryError> {
        match id {
            "openai_translate" => Ok(Arc::new(OpenAiTranslate::new(
                self.chat("openai_translate")?,
            ))),
            other => Err(RegistryError::UnknownProvider(
                other.to_string(),
                Stage::Translation,
            )),
        }
    }

    fn description(&self, id: &str) -> Result<Arc<dyn DescriptionProvider>, RegistryError> {
        match id {
            "openai_describe" => Ok(Arc::new(OpenAiDescribe::new(self.chat("openai_describe")?))),
            other => Err(RegistryError::UnknownProvider(
                other.to_string(),
                Stage::Description,
            )),
        }
    }

    fn allergen(&self, id: &str) -> Result<Arc<dyn AllergenProvider>, RegistryError> {
        match id {
            "openai_allergens" => Ok(Arc::new(OpenAiAllergens::new(
                self.chat("openai_allergens")?,
            ))),
            other => Err(RegistryError::UnknownProvider(
                other.to_string(),
                Stage::Allergen,
            )),
        }
    }

    fn ingredient(&self, id: &str) -> Result<Arc<dyn IngredientProvider>, RegistryError> {
        match id {
            "openai_ingredients" => Ok(Arc::new(OpenAiIngredients::new(
                self.chat("openai_ingredients")?,
            ))),
            other => Err(RegistryError::UnknownProvider(
                other.to_string(),
                Stage::Ingredient,
            )),
        }
    }

    fn image_search(&self, id: &str) -> Result<Arc<dyn ImageSearchProvider>, RegistryError> {
        match id {
            "google_image_search" => {
                let (api_key, cse_id) = self.google("google_image_search")?;
                Ok(Arc::new(GoogleImageSearch::new(
                    api_key,
                    cse_id,
                    IMAGE_SEARCH_RESULTS,
                )))
            }
            other => Err(RegistryError::UnknownProvider(
                other.to_string(),
                Stage::ImageSearch,
            )),
        }
    }

    fn image_gen(&self, id: &str) -> Result<Arc<dyn ImageGenProvider>, RegistryError> {
        match id {
            "openai_image_gen" => Ok(Arc::new(OpenAiImageGen::new(
                self.openai_config("openai_image_gen")?,
            ))),
            other => Err(RegistryError::UnknownProvider(
                other.to_string(),
                Stage::ImageGen,
            )),
        }
    }
}

fn build_chain<P: ?Sized + providers::Identified + Send + Sync, F>(
    config: &PipelineConfig,
    stage: Stage,
    construct: F,
) -> Result<Chain<P>, RegistryError>
where
    F: Fn(&str) -> Result<Arc<P>, RegistryError>,
{
    let ids = config.provider_chain.for_stage(stage);
    if ids.is_empty() {
        return Err(RegistryError::EmptyChain(stage));
    }
    let providers = ids
        .iter()
        .map(|id| construct(id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Chain::new(providers, config.retry_policy(stage)))
}

pub fn build_stage_chains(config: &PipelineConfig) -> Result<StageChains, RegistryError> {
    let factory = ProviderFactory::from_env();
    Ok(StageChains {
        translation: build_chain(config, Stage::Translation, |id| factory.translation(id))?,
        description: build_chain(config, Stage::Description, |id| factory.description(id))?,
        allergen: build_chain(config, Stage::Allergen, |id| factory.allergen(id))?,
        ingredient: build_chain(config, Stage::Ingredient, |id| factory.ingredient(id))?,
        image_search: build_chain(config, Stage::ImageSearch, |id| factory.image_search(id))?,
        image_gen: build_chain(config, Stage::ImageGen, |id| factory.image_gen(id))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use menulens_pipeline::ProviderChainConfig;

    #[test]
    fn unknown_identifier_is_rejected() {
        let mut config = PipelineConfig::default();
        config.provider_chain = ProviderChainConfig {
            translation: vec!["definitely_not_real".to_string()],
            ..ProviderChainConfig::default()
        };
        let factory = ProviderFactory {
            chat: None,
            openai_config: None,
            google: None,
        };
        let result = build_chain(&config, Stage::Translation, |id| factory.translation(id));
        assert!(matches!(
            result,
            Err(RegistryError::UnknownProvider(_, Stage::Translation)),
        ));
    }

    #[test]
    fn empty_chain_is_rejected() {
        let mut config = PipelineConfig::default();
        config.provider_chain.image_gen.clear();
        let factory = ProviderFactory {
            chat: None,
            openai_config: None,
            google: None,
        };
        let result = build_chain(&config, Stage::ImageGen, |id| factory.image_gen(id));
        assert!(matches!(result, Err(RegistryError::EmptyChain(Stage::ImageGen))));
    }
}
