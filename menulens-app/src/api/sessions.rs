use crate::api::error::ApiError;
use menulens_db::types::{MenuItem, Progress, SessionSnapshot, SessionStatus};
use menulens_pipeline::Application;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use serde::{Deserialize, Serialize};

const DEFAULT_SEARCH_LIMIT: i64 = 20;
const MAX_SEARCH_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub items: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub total_items: i32,
    pub status: SessionStatus,
}

#[post("/sessions", data = "<body>")]
pub async fn create_session(
    body: Json<CreateSessionRequest>,
    app: &State<Application>,
) -> Result<status::Created<Json<CreateSessionResponse>>, ApiError> {
    let body = body.into_inner();
    let metadata = body.metadata.unwrap_or_else(|| serde_json::json!({}));

    let session = app
        .orchestrator()
        .start_session(body.session_id, body.items, metadata)
        .await?;

    let location = format!("/api/sessions/{}", session.session_id);
    Ok(status::Created::new(location).body(Json(CreateSessionResponse {
        session_id: session.session_id,
        total_items: session.total_items,
        status: session.status,
    })))
}

#[get("/sessions/<session_id>")]
pub async fn get_session(
    session_id: &str,
    app: &State<Application>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let snapshot = app.store().get_session(session_id).await?;
    Ok(Json(snapshot))
}

#[get("/sessions/<session_id>/progress")]
pub async fn get_progress(
    session_id: &str,
    app: &State<Application>,
) -> Result<Json<Progress>, ApiError> {
    let progress = app.store().get_progress(session_id).await?;
    Ok(Json(progress))
}

#[derive(Debug, Serialize)]
pub struct CancelSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

#[post("/sessions/<session_id>/cancel")]
pub async fn cancel_session(
    session_id: &str,
    app: &State<Application>,
) -> Result<Json<CancelSessionResponse>, ApiError> {
    app.orchestrator().cancel_session(session_id).await?;
    Ok(Json(CancelSessionResponse {
        session_id: session_id.to_string(),
        status: SessionStatus::Failed,
    }))
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub items: Vec<MenuItem>,
}

#[get("/items/search?<q>&<category>&<limit>")]
pub async fn search_items(
    q: Option<&str>,
    category: Option<&str>,
    limit: Option<i64>,
    app: &State<Application>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = q
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("query parameter q is required".to_string()))?;
    let limit = limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    let items = app.store().search_items(query, category, limit).await?;
    Ok(Json(SearchResponse { items }))
}
