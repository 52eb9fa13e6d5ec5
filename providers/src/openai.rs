//! OpenAI-backed providers. One chat-completions client shared by the four
//! text stages, plus the images endpoint for generation. All requests go
//! through JSON mode so the model output parses into the typed results.

use crate::error::ProviderError;
use crate::{
    AllergenProvider, DescriptionProvider, GeneratedImage, Identified, ImageGenProvider,
    IngredientProvider, Translation, TranslationProvider,
};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            image_model: "dall-e-3".to_string(),
        }
    }
}

/// Thin chat-completions wrapper. The reqwest client is internally reference
/// counted, so cloning this is cheap.
#[derive(Clone)]
pub struct OpenAiChat {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiChat {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn chat_json(
        &self,
        provider_id: &str,
        system: &str,
        user: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        debug!("Sending chat request for {provider_id}");
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.2,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(provider_id, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(provider_id, e))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(provider_id, status, &text));
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::malformed(provider_id, format!("unexpected response structure: {e}"))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::malformed(provider_id, "response contained no choices"))?
            .message
            .content;

        serde_json::from_str(&content).map_err(|e| {
            ProviderError::malformed(provider_id, format!("model output was not valid JSON: {e}"))
        })
    }
}

fn string_list(
    provider_id: &str,
    value: serde_json::Value,
    key: &str,
) -> Result<Vec<String>, ProviderError> {
    #[derive(Deserialize)]
    struct Items {
        #[serde(alias = "allergens", alias = "ingredients")]
        items: Vec<String>,
    }
    let items: Items = serde_json::from_value(value)
        .map_err(|e| ProviderError::malformed(provider_id, format!("missing {key} list: {e}")))?;
    Ok(items
        .items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

pub struct OpenAiTranslate {
    chat: OpenAiChat,
}

impl OpenAiTranslate {
    pub fn new(chat: OpenAiChat) -> Self {
        Self { chat }
    }
}

impl Identified for OpenAiTranslate {
    fn id(&self) -> &'static str {
        "openai_translate"
    }
}

#[async_trait]
impl TranslationProvider for OpenAiTranslate {
    async fn translate(&self, japanese: &str) -> Result<Translation, ProviderError> {
        let value = self
            .chat
            .chat_json(
                self.id(),
                "You translate Japanese restaurant dish names to natural English menu names. \
                 Respond with JSON: {\"english\": string, \"category\": one of \
                 \"Appetizer\", \"Main\", \"Side\", \"Dessert\", \"Drink\", \"Other\"}.",
                &format!("Dish name: {japanese}"),
            )
            .await?;

        let translation: Translation = serde_json::from_value(value)
            .map_err(|e| ProviderError::malformed(self.id(), format!("bad translation: {e}")))?;
        if translation.english.trim().is_empty() {
            return Err(ProviderError::malformed(self.id(), "empty translation"));
        }
        Ok(translation)
    }
}

pub struct OpenAiDescribe {
    chat: OpenAiChat,
}

impl OpenAiDescribe {
    pub fn new(chat: OpenAiChat) -> Self {
        Self { chat }
    }
}

impl Identified for OpenAiDescribe {
    fn id(&self) -> &'static str {
        "openai_describe"
    }
}

#[async_trait]
impl DescriptionProvider for OpenAiDescribe {
    async fn describe(
        &self,
        japanese: &str,
        english: Option<&str>,
        category: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut user = format!("Dish name (Japanese): {japanese}");
        if let Some(english) = english {
            user.push_str(&format!("\nEnglish name: {english}"));
        }
        if let Some(category) = category {
            user.push_str(&format!("\nCategory: {category}"));
        }

        let value = self
            .chat
            .chat_json(
                self.id(),
                "You write appetizing two-to-three sentence descriptions of Japanese dishes \
                 for foreign diners, mentioning preparation and typical flavors. \
                 Respond with JSON: {\"description\": string}.",
                &user,
            )
            .await?;

        #[derive(Deserialize)]
        struct Out {
            description: String,
        }
        let out: Out = serde_json::from_value(value)
            .map_err(|e| ProviderError::malformed(self.id(), format!("bad description: {e}")))?;
        if out.description.trim().is_empty() {
            return Err(ProviderError::malformed(self.id(), "empty description"));
        }
        Ok(out.description)
    }
}

pub struct OpenAiAllergens {
    chat: OpenAiChat,
}

impl OpenAiAllergens {
    pub fn new(chat: OpenAiChat) -> Self {
        Self { chat }
    }
}

impl Identified for OpenAiAllergens {
    fn id(&self) -> &'static str {
        "openai_allergens"
    }
}

#[async_trait]
impl AllergenProvider for OpenAiAllergens {
    async fn allergens(
        &self,
        japanese: &str,
        english: Option<&str>,
    ) -> Result<Vec<String>, ProviderError> {
        let mut user = format!("Dish name (Japanese): {japanese}");
        if let Some(english) = english {
            user.push_str(&format!("\nEnglish name: {english}"));
        }
        let value = self
            .chat
            .chat_json(
                self.id(),
                "You list the allergens typically present in a Japanese dish, using standard \
                 allergen names (wheat, soy, egg, milk, fish, shellfish, sesame, peanut, \
                 tree nut, buckwheat). An empty list is valid. \
                 Respond with JSON: {\"items\": [string]}.",
                &user,
            )
            .await?;
        string_list(self.id(), value, "allergen")
    }
}

pub struct OpenAiIngredients {
    chat: OpenAiChat,
}

impl OpenAiIngredients {
    pub fn new(chat: OpenAiChat) -> Self {
        Self { chat }
    }
}

impl Identified for OpenAiIngredients {
    fn id(&self) -> &'static str {
        "openai_ingredients"
    }
}

#[async_trait]
impl IngredientProvider for OpenAiIngredients {
    async fn ingredients(
        &self,
        japanese: &str,
        english: Option<&str>,
    ) -> Result<Vec<String>, ProviderError> {
        let mut user = format!("Dish name (Japanese): {japanese}");
        if let Some(english) = english {
            user.push_str(&format!("\nEnglish name: {english}"));
        }
        let value = self
            .chat
            .chat_json(
                self.id(),
                "You list the main ingredients of a Japanese dish as short English nouns, \
                 most significant first, at most twelve. \
                 Respond with JSON: {\"items\": [string]}.",
                &user,
            )
            .await?;
        string_list(self.id(), value, "ingredient")
    }
}

pub struct OpenAiImageGen {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiImageGen {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

impl Identified for OpenAiImageGen {
    fn id(&self) -> &'static str {
        "openai_image_gen"
    }
}

#[async_trait]
impl ImageGenProvider for OpenAiImageGen {
    async fn generate(
        &self,
        japanese: &str,
        english: Option<&str>,
        description: Option<&str>,
    ) -> Result<GeneratedImage, ProviderError> {
        let name = english.unwrap_or(japanese);
        let mut prompt = format!(
            "A professional food photograph of {name}, a Japanese restaurant dish, \
             plated on a ceramic dish, natural light, shallow depth of field."
        );
        if let Some(description) = description {
            prompt.push_str(&format!(" The dish: {description}"));
        }

        let body = serde_json::json!({
            "model": self.config.image_model,
            "prompt": prompt,
            "n": 1,
            "size": "1024x1024",
        });

        let response = self
            .client
            .post(format!("{}/images/generations", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.id(), e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.id(), e))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(self.id(), status, &text));
        }

        #[derive(Deserialize)]
        struct ImageResponse {
            data: Vec<ImageDatum>,
        }
        #[derive(Deserialize)]
        struct ImageDatum {
            url: String,
        }

        let parsed: ImageResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::malformed(self.id(), format!("unexpected response structure: {e}"))
        })?;
        let url = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::malformed(self.id(), "response contained no images"))?
            .url;

        Ok(GeneratedImage {
            url,
            storage_key: None,
            prompt,
        })
    }
}
