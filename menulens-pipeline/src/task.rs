use menulens_db::types::Stage;
use tokio::time::Instant;

/// Inputs a stage worker hands to its provider. Only the Japanese text is
/// guaranteed; the rest is filled in when a task is enqueued after the
/// item's translation finished.
#[derive(Debug, Clone)]
pub struct StageInputs {
    pub japanese_text: String,
    pub english_text: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
}

impl StageInputs {
    pub fn from_japanese(japanese_text: impl Into<String>) -> Self {
        Self {
            japanese_text: japanese_text.into(),
            english_text: None,
            category: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageTask {
    pub session_id: String,
    pub item_id: i32,
    pub stage: Stage,
    pub inputs: StageInputs,
    pub attempt: u32,
    /// Monotonic absolute deadline. Workers abort the provider call and
    /// report a timeout once it passes.
    pub deadline: Instant,
}
