use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::api::ErrorResponse;

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("Channel '{0}' not found")]
    ChannelNotFound(String),
    #[error("Subscription '{0}' is closed")]
    Closed(String),
    #[error("Subscription '{0}' does not exist")]
    NotSubscribed(String),
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Connection to channel provider failed: {0}")]
    Connect(String),
    #[error("Failed to send to channel provider: {0}")]
    SendFail(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
}

impl<T> From<std::sync::PoisonError<T>> for ChannelError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ChannelError::LockPoisoned(e.to_string())
    }
}

impl IntoResponse for ChannelError {
    fn into_response(self) -> Response {
        let status = match self {
            ChannelError::ChannelNotFound(_) | ChannelError::NotSubscribed(_) => {
                StatusCode::NOT_FOUND
            }
            ChannelError::InvalidFrame(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let kind = match self {
            ChannelError::ChannelNotFound(_) => "ChannelNotFound",
            ChannelError::Closed(_) => "Closed",
            ChannelError::NotSubscribed(_) => "NotSubscribed",
            ChannelError::LockPoisoned(_) => "LockPoisoned",
            ChannelError::Connect(_) => "Connect",
            ChannelError::SendFail(_) => "SendFail",
            ChannelError::InvalidFrame(_) => "InvalidFrame",
        };
        (status, Json(ErrorResponse::new(kind, &self.to_string()))).into_response()
    }
}
