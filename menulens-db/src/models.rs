use chrono::NaiveDateTime;
use diesel::prelude::*;

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::sessions)]
pub struct NewSession<'a> {
    pub session_id: &'a str,
    pub total_items: i32,
    pub status: &'a str,
    pub metadata: &'a serde_json::Value,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::sessions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbSession {
    pub session_id: String,
    pub total_items: i32,
    pub status: String,
    pub last_event_id: i64,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::menu_items)]
pub struct NewMenuItem<'a> {
    pub session_id: &'a str,
    pub item_id: i32,
    pub japanese_text: &'a str,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::menu_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbMenuItem {
    pub session_id: String,
    pub item_id: i32,
    pub japanese_text: String,
    pub english_text: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub allergens: Option<serde_json::Value>,
    pub ingredients: Option<serde_json::Value>,
    pub translation_status: String,
    pub description_status: String,
    pub image_status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::item_stages)]
pub struct NewItemStage<'a> {
    pub session_id: &'a str,
    pub item_id: i32,
    pub stage: &'a str,
    pub status: &'a str,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::item_stages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbItemStage {
    pub session_id: String,
    pub item_id: i32,
    pub stage: String,
    pub status: String,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub attempt_count: i32,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::processing_providers)]
pub struct NewProcessingProvider<'a> {
    pub session_id: &'a str,
    pub item_id: i32,
    pub stage: &'a str,
    pub provider: &'a str,
    pub succeeded: bool,
    pub error_class: Option<String>,
    pub error_message: Option<&'a str>,
    pub processing_time_ms: i64,
    pub fallback_used: bool,
    pub provider_metadata: Option<&'a serde_json::Value>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::processing_providers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbProcessingProvider {
    pub id: i64,
    pub session_id: String,
    pub item_id: i32,
    pub stage: String,
    pub provider: String,
    pub succeeded: bool,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub processed_at: NaiveDateTime,
    pub processing_time_ms: i64,
    pub fallback_used: bool,
    pub provider_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::menu_item_images)]
pub struct NewMenuItemImage<'a> {
    pub session_id: &'a str,
    pub item_id: i32,
    pub stage: &'a str,
    pub image_url: &'a str,
    pub storage_key: Option<&'a str>,
    pub prompt: Option<&'a str>,
    pub provider: &'a str,
    pub fallback_used: bool,
    pub image_metadata: Option<&'a serde_json::Value>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::menu_item_images)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbMenuItemImage {
    pub id: i64,
    pub session_id: String,
    pub item_id: i32,
    pub stage: String,
    pub image_url: String,
    pub storage_key: Option<String>,
    pub prompt: Option<String>,
    pub provider: String,
    pub fallback_used: bool,
    pub image_metadata: Option<serde_json::Value>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::session_events)]
pub struct NewSessionEvent<'a> {
    pub session_id: &'a str,
    pub event_id: i64,
    pub item_id: Option<i32>,
    pub stage: Option<&'a str>,
    pub event_type: &'a str,
    pub payload: &'a serde_json::Value,
    pub provider: Option<&'a str>,
    pub elapsed_ms: Option<i64>,
    pub fallback_used: Option<bool>,
    pub occurred_at: NaiveDateTime,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::session_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbSessionEvent {
    pub session_id: String,
    pub event_id: i64,
    pub item_id: Option<i32>,
    pub stage: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub provider: Option<String>,
    pub elapsed_ms: Option<i64>,
    pub fallback_used: Option<bool>,
    pub occurred_at: NaiveDateTime,
}
