use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Matrix error codes the federation ingress surface can return
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("{0}")]
    BadJson(String),

    #[error("{0}")]
    NotJson(String),

    #[error("Cannot process request")]
    Unknown,
}

impl MatrixError {
    pub fn to_response_parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            MatrixError::BadJson(_) => (StatusCode::BAD_REQUEST, "M_BAD_JSON", self.to_string()),
            MatrixError::NotJson(_) => (StatusCode::BAD_REQUEST, "M_NOT_JSON", self.to_string()),
            MatrixError::Unknown => {
                (StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN", self.to_string())
            }
        }
    }
}

impl IntoResponse for MatrixError {
    fn into_response(self) -> Response {
        let (status, errcode, message) = self.to_response_parts();
        let body = json!({
            "errcode": errcode,
            "error": message,
        });
        (status, Json(body)).into_response()
    }
}
