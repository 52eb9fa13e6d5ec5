//! Google Custom Search image provider.

use crate::error::ProviderError;
use crate::{FoundImage, Identified, ImageSearchProvider};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

const SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";

pub struct GoogleImageSearch {
    client: reqwest::Client,
    api_key: String,
    cse_id: String,
    max_results: u8,
}

impl GoogleImageSearch {
    pub fn new(api_key: impl Into<String>, cse_id: impl Into<String>, max_results: u8) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            cse_id: cse_id.into(),
            // The API caps num at 10
            max_results: max_results.min(10),
        }
    }
}

impl Identified for GoogleImageSearch {
    fn id(&self) -> &'static str {
        "google_image_search"
    }
}

#[async_trait]
impl ImageSearchProvider for GoogleImageSearch {
    async fn search(
        &self,
        japanese: &str,
        english: Option<&str>,
    ) -> Result<Vec<FoundImage>, ProviderError> {
        // The Japanese name finds the most faithful photos; the English name
        // widens the net when we have it.
        let query = match english {
            Some(english) => format!("{japanese} {english} dish"),
            None => format!("{japanese} 料理"),
        };
        debug!("Searching images for {query:?}");

        let num = self.max_results.to_string();
        let response = self
            .client
            .get(SEARCH_URL)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cse_id.as_str()),
                ("q", query.as_str()),
                ("searchType", "image"),
                ("safe", "active"),
                ("num", num.as_str()),
            ])
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
        struct SearchResponse {
            items: Option<Vec<SearchItem>>,
        }
        #[derive(Deserialize)]
        struct SearchItem {
            link: String,
            image: Option<ImageInfo>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ImageInfo {
            context_link: Option<String>,
            thumbnail_link: Option<String>,
            width: Option<i64>,
            height: Option<i64>,
        }

        let parsed: SearchResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::malformed(self.id(), format!("unexpected response structure: {e}"))
        })?;

        let images = parsed
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|item| {
                let info = item.image;
                FoundImage {
                    url: item.link,
                    source_page: info.as_ref().and_then(|i| i.context_link.clone()),
                    thumbnail_url: info.as_ref().and_then(|i| i.thumbnail_link.clone()),
                    width: info.as_ref().and_then(|i| i.width),
                    height: info.as_ref().and_then(|i| i.height),
                }
            })
            .collect();

        Ok(images)
    }
}
