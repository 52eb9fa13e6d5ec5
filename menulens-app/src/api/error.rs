use log::error;
use menulens_db::StoreError;
use menulens_pipeline::StartError;
use miette::Diagnostic;
use rocket::http::Status;
use rocket::response::Responder;
use rocket::{Request, Response};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    QueueSaturated(String),

    #[error("{0}")]
    ProviderUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> Status {
        match self {
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::Conflict(_) => Status::Conflict,
            ApiError::QueueSaturated(_) => Status::TooManyRequests,
            ApiError::ProviderUnavailable(_) => Status::ServiceUnavailable,
            ApiError::Internal(_) => Status::InternalServerError,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Conflict(session_id) => {
                ApiError::Conflict(format!("session {session_id} already exists"))
            }
            StoreError::AlreadyTerminal(session_id) => {
                ApiError::Conflict(format!("session {session_id} is already terminal"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StartError> for ApiError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::Validation(message) => ApiError::BadRequest(message),
            StartError::Store(store) => store.into(),
            StartError::QueueFull { stage } => {
                ApiError::QueueSaturated(format!("the {stage} worker queue is saturated"))
            }
            StartError::ProviderUnavailable { stage } => ApiError::ProviderUnavailable(format!(
                "no provider is available for the {stage} stage"
            )),
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();
        if status == Status::InternalServerError {
            error!("{:#?}", self);
        }
        let rendered = serde_json::json!({ "error": self.to_string() }).to_string();

        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(rendered.len(), std::io::Cursor::new(rendered))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use menulens_db::types::Stage;

    #[test]
    fn error_taxonomy_maps_to_documented_statuses() {
        assert_eq!(
            ApiError::from(StartError::Validation("bad".to_string())).status(),
            Status::BadRequest,
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound("s".to_string())).status(),
            Status::NotFound,
        );
        assert_eq!(
            ApiError::from(StoreError::Conflict("s".to_string())).status(),
            Status::Conflict,
        );
        assert_eq!(
            ApiError::from(StoreError::AlreadyTerminal("s".to_string())).status(),
            Status::Conflict,
        );
        assert_eq!(
            ApiError::from(StartError::QueueFull {
                stage: Stage::Translation,
            })
            .status(),
            Status::TooManyRequests,
        );
        assert_eq!(
            ApiError::from(StartError::ProviderUnavailable {
                stage: Stage::ImageGen,
            })
            .status(),
            Status::ServiceUnavailable,
        );
    }
}
