//! Domain types shared by the store, the pipeline, and the HTTP surface.
//! Enums are persisted as their snake_case strings.

use chrono::{DateTime, Utc};
use providers::{ErrorKind, ProviderAttempt};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One kind of per-item enrichment.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    enum_map::Enum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Translation,
    Description,
    Allergen,
    Ingredient,
    ImageSearch,
    ImageGen,
}

impl Stage {
    pub fn is_image(self) -> bool {
        matches!(self, Stage::ImageSearch | Stage::ImageGen)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    ItemCreated,
    StageProcessing,
    StageCompleted,
    StageFailed,
    SessionCompleted,
    Heartbeat,
}

/// Why a stage failed. Mirrors the provider error kinds plus the two classes
/// only the pipeline itself can produce.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Auth,
    RateLimit,
    Timeout,
    Upstream,
    Transient,
    Permanent,
    Cancelled,
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation => FailureKind::Validation,
            ErrorKind::Auth => FailureKind::Auth,
            ErrorKind::RateLimit => FailureKind::RateLimit,
            ErrorKind::Timeout => FailureKind::Timeout,
            ErrorKind::Upstream => FailureKind::Upstream,
            ErrorKind::Transient => FailureKind::Transient,
            ErrorKind::Permanent => FailureKind::Permanent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "session was cancelled")
    }

    pub fn timed_out(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, detail)
    }
}

/// An image to attach to an item, found or generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_url: String,
    pub storage_key: Option<String>,
    pub prompt: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// The successful output of one stage, shaped for persistence.
#[derive(Debug, Clone)]
pub enum StagePayload {
    Translation { english: String, category: String },
    Description { description: String },
    Allergens { allergens: Vec<String> },
    Ingredients { ingredients: Vec<String> },
    ImageSearch { images: Vec<ImageRecord> },
    ImageGen { image: ImageRecord },
}

impl StagePayload {
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Translation { .. } => Stage::Translation,
            StagePayload::Description { .. } => Stage::Description,
            StagePayload::Allergens { .. } => Stage::Allergen,
            StagePayload::Ingredients { .. } => Stage::Ingredient,
            StagePayload::ImageSearch { .. } => Stage::ImageSearch,
            StagePayload::ImageGen { .. } => Stage::ImageGen,
        }
    }

    /// What the corresponding `stage_completed` event carries.
    pub fn event_payload(&self) -> serde_json::Value {
        match self {
            StagePayload::Translation { english, category } => {
                json!({ "english_text": english, "category": category })
            }
            StagePayload::Description { description } => {
                json!({ "description": description })
            }
            StagePayload::Allergens { allergens } => json!({ "allergens": allergens }),
            StagePayload::Ingredients { ingredients } => json!({ "ingredients": ingredients }),
            StagePayload::ImageSearch { images } => {
                let urls: Vec<&str> = images.iter().map(|i| i.image_url.as_str()).collect();
                json!({ "image_urls": urls })
            }
            StagePayload::ImageGen { image } => {
                json!({ "image_url": image.image_url, "prompt": image.prompt })
            }
        }
    }
}

/// Which provider answered (or gave up) and the full attempt history, as
/// reported by the provider chain.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub provider: String,
    pub elapsed_ms: i64,
    pub fallback_used: bool,
    pub attempts: Vec<ProviderAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub total_items: i32,
    pub status: SessionStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MenuItem {
    pub session_id: String,
    pub item_id: i32,
    pub japanese_text: String,
    pub english_text: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub allergens: Option<Vec<String>>,
    pub ingredients: Option<Vec<String>>,
    pub translation_status: StageStatus,
    pub description_status: StageStatus,
    pub image_status: StageStatus,
    pub images: Vec<ItemImage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemImage {
    pub stage: Stage,
    pub image_url: String,
    pub storage_key: Option<String>,
    pub prompt: Option<String>,
    pub provider: String,
    pub fallback_used: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub items: Vec<MenuItem>,
}

/// One provider attempt as persisted for analytics.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRecord {
    pub item_id: i32,
    pub stage: Stage,
    pub provider: String,
    pub succeeded: bool,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub processing_time_ms: i64,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StageCounts {
    pub fn add(&mut self, status: StageStatus) {
        match status {
            StageStatus::Pending => self.pending += 1,
            StageStatus::Processing => self.processing += 1,
            StageStatus::Completed => self.completed += 1,
            StageStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub total: i64,
    pub per_stage_counts: std::collections::BTreeMap<Stage, StageCounts>,
    pub fully_completed: i64,
    pub percentage: f64,
}

/// One entry in a session's ordered event log. Also the SSE payload shape.
#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub event_id: i64,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

/// An event about to be appended to a session's log. The store assigns the
/// event id and timestamp at append time.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub item_id: Option<i32>,
    pub stage: Option<Stage>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub provider: Option<String>,
    pub elapsed_ms: Option<i64>,
    pub fallback_used: Option<bool>,
}

impl EventDraft {
    fn bare(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            item_id: None,
            stage: None,
            event_type,
            payload,
            provider: None,
            elapsed_ms: None,
            fallback_used: None,
        }
    }

    pub fn session_started(total_items: i32) -> Self {
        Self::bare(
            EventType::SessionStarted,
            json!({ "total_items": total_items }),
        )
    }

    pub fn item_created(item_id: i32, japanese_text: &str) -> Self {
        Self {
            item_id: Some(item_id),
            ..Self::bare(
                EventType::ItemCreated,
                json!({ "japanese_text": japanese_text }),
            )
        }
    }

    pub fn stage_processing(item_id: i32, stage: Stage) -> Self {
        Self {
            item_id: Some(item_id),
            stage: Some(stage),
            ..Self::bare(EventType::StageProcessing, json!({}))
        }
    }

    pub fn stage_completed(
        item_id: i32,
        stage: Stage,
        payload: serde_json::Value,
        info: &ProviderInfo,
    ) -> Self {
        Self {
            item_id: Some(item_id),
            stage: Some(stage),
            provider: (!info.provider.is_empty()).then(|| info.provider.clone()),
            elapsed_ms: Some(info.elapsed_ms),
            fallback_used: Some(info.fallback_used),
            ..Self::bare(EventType::StageCompleted, payload)
        }
    }

    pub fn stage_failed(
        item_id: i32,
        stage: Stage,
        failure: &StageFailure,
        info: &ProviderInfo,
    ) -> Self {
        Self {
            item_id: Some(item_id),
            stage: Some(stage),
            provider: (!info.provider.is_empty()).then(|| info.provider.clone()),
            elapsed_ms: Some(info.elapsed_ms),
            fallback_used: Some(info.fallback_used),
            ..Self::bare(
                EventType::StageFailed,
                json!({ "error_class": failure.kind, "error": failure.message }),
            )
        }
    }

    pub fn session_completed(payload: serde_json::Value) -> Self {
        Self::bare(EventType::SessionCompleted, payload)
    }
}

/// A stage stuck in `processing` past its deadline, as found by the
/// reconciliation sweep.
#[derive(Debug, Clone)]
pub struct StuckStage {
    pub session_id: String,
    pub item_id: i32,
    pub stage: Stage,
}

/// Builds the summary payload for the terminal `session_completed` event.
/// An item counts as completed when every one of its stages is terminal,
/// regardless of per-stage success.
pub fn session_summary_payload(
    status: SessionStatus,
    total_items: i32,
    stage_statuses: &[(i32, Stage, StageStatus)],
) -> serde_json::Value {
    let mut per_item_terminal: hashbrown::HashMap<i32, bool> = hashbrown::HashMap::new();
    let mut per_stage: std::collections::BTreeMap<Stage, StageCounts> = Default::default();

    for (item_id, stage, stage_status) in stage_statuses {
        per_stage.entry(*stage).or_default().add(*stage_status);
        let all_terminal = per_item_terminal.entry(*item_id).or_insert(true);
        *all_terminal = *all_terminal && stage_status.is_terminal();
    }

    let completed_count = per_item_terminal.values().filter(|t| **t).count() as i64;
    let failed_count = total_items as i64 - completed_count;

    json!({
        "status": status,
        "completed_count": completed_count,
        "failed_count": failed_count,
        "per_stage_counts": per_stage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn stage_strings_match_the_wire_names() {
        let names: Vec<String> = Stage::iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            [
                "translation",
                "description",
                "allergen",
                "ingredient",
                "image_search",
                "image_gen",
            ],
        );
    }

    #[test]
    fn summary_counts_items_with_all_stages_terminal() {
        // Item 0 fully terminal (one stage failed), item 1 still processing.
        let statuses = vec![
            (0, Stage::Translation, StageStatus::Completed),
            (0, Stage::ImageGen, StageStatus::Failed),
            (1, Stage::Translation, StageStatus::Processing),
        ];
        let payload = session_summary_payload(SessionStatus::Failed, 2, &statuses);
        assert_eq!(payload["completed_count"], 1);
        assert_eq!(payload["failed_count"], 1);
        assert_eq!(payload["per_stage_counts"]["image_gen"]["failed"], 1);
    }

    #[test]
    fn event_row_serializes_to_the_documented_envelope() {
        let event = EventRow {
            event_id: 42,
            session_id: "s1".to_string(),
            item_id: Some(3),
            stage: Some(Stage::Translation),
            event_type: EventType::StageCompleted,
            payload: json!({ "english_text": "Grilled Chicken Skewers" }),
            provider: Some("openai_translate".to_string()),
            elapsed_ms: Some(187),
            fallback_used: Some(false),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_id"], 42);
        assert_eq!(value["stage"], "translation");
        assert_eq!(value["type"], "stage_completed");
        assert_eq!(value["payload"]["english_text"], "Grilled Chicken Skewers");
    }
}
