use crate::adapter::AdapterError;
use crate::relay::TransportError;
use crate::validation::ValidationError;
use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use brennon_db::DbError;
use serde::Serialize;
use thiserror::Error;

/// Failures of the coordination core.
#[derive(Debug, Error)]
pub enum BrennonError {
  /// Broken rank graph or missing default rank. Fatal at startup.
  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("rank not found: {0}")]
  RankNotFound(String),

  #[error("server not found: {0}")]
  ServerNotFound(String),

  #[error("server group not found: {0}")]
  GroupNotFound(String),

  #[error("punishment not found: {0}")]
  PunishmentNotFound(String),

  #[error("player not found: {0}")]
  PlayerNotFound(String),

  #[error("server {0} is offline")]
  ServerOffline(String),

  #[error("server {0} is full")]
  ServerFull(String),

  #[error("server group {0} is full")]
  GroupFull(String),

  #[error("server group {0} is restricted")]
  Restricted(String),

  #[error("server {0} is already registered")]
  ServerExists(String),

  #[error("server group {0} still has servers")]
  GroupNotEmpty(String),

  #[error("no fallback server available")]
  NoFallbackServer,

  #[error("transport unavailable")]
  TransportUnavailable,

  #[error("timed out: {0}")]
  Timeout(&'static str),

  #[error("banned: {reason}")]
  Banned {
    id: String,
    reason: String,
    expires_at: Option<i64>,
  },

  /// Relay has been disconnected past the staleness threshold.
  #[error("punishment state is stale; refusing to admit")]
  Stale,

  #[error("cancelled: {0}")]
  Cancelled(String),

  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error(transparent)]
  Adapter(#[from] AdapterError),

  #[error("codec error: {0}")]
  Codec(#[from] serde_json::Error),

  #[error(transparent)]
  Database(#[from] DbError),
}

impl From<TransportError> for BrennonError {
  fn from(err: TransportError) -> Self {
    tracing::warn!(error = %err, "transport call failed");
    BrennonError::TransportUnavailable
  }
}

pub type Result<T> = std::result::Result<T, BrennonError>;

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub details: Option<String>,
}

impl ErrorResponse {
  pub fn new(error: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      details: None,
    }
  }

  pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      details: Some(details.into()),
    }
  }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
  Core(BrennonError),
  ValidationError(String),
  Unauthorized,
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    match self {
      AppError::Core(err) => {
        let (status, response) = core_error_response(&err);
        if status.is_server_error() {
          tracing::error!(error = ?err, "request failed");
        } else {
          tracing::debug!(error = %err, "request rejected");
        }
        (status, Json(response)).into_response()
      }
      AppError::ValidationError(msg) => {
        tracing::warn!(validation_error = %msg, "Validation failed");
        (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(msg))).into_response()
      }
      AppError::Unauthorized => (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new("Invalid or missing API key")),
      )
        .into_response(),
    }
  }
}

fn core_error_response(err: &BrennonError) -> (StatusCode, ErrorResponse) {
  use BrennonError::*;

  let status = match err {
    RankNotFound(_) | ServerNotFound(_) | GroupNotFound(_) | PunishmentNotFound(_) | PlayerNotFound(_) => {
      StatusCode::NOT_FOUND
    }
    ServerOffline(_) | ServerFull(_) | GroupFull(_) | NoFallbackServer | Cancelled(_) | ServerExists(_)
    | GroupNotEmpty(_) => StatusCode::CONFLICT,
    Restricted(_) | Banned { .. } => StatusCode::FORBIDDEN,
    TransportUnavailable | Stale => StatusCode::SERVICE_UNAVAILABLE,
    Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    Validation(_) => StatusCode::BAD_REQUEST,
    Adapter(_) => StatusCode::BAD_GATEWAY,
    Database(DbError::PlayerNotFound | DbError::RankNotFound | DbError::PunishmentNotFound) => {
      StatusCode::NOT_FOUND
    }
    Database(DbError::ServerNotFound | DbError::GroupNotFound) => StatusCode::NOT_FOUND,
    // Refused structural changes: a broken rank graph or a protected group or server
    Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
    Codec(_) | Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
  };

  // Don't expose internal errors
  let response = if status == StatusCode::INTERNAL_SERVER_ERROR {
    ErrorResponse::new("An internal error occurred. Please try again later.")
  } else if let Banned { expires_at: Some(expires_at), .. } = err {
    ErrorResponse::with_details(err.to_string(), format!("expires_at={expires_at}"))
  } else {
    ErrorResponse::new(err.to_string())
  };

  (status, response)
}

impl From<BrennonError> for AppError {
  fn from(err: BrennonError) -> Self {
    match err {
      BrennonError::Validation(err) => AppError::ValidationError(err.to_string()),
      err => AppError::Core(err),
    }
  }
}

impl From<ValidationError> for AppError {
  fn from(err: ValidationError) -> Self {
    AppError::ValidationError(err.to_string())
  }
}
