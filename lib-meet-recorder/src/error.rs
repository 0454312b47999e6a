use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde_json::json;

/// An error carrying the HTTP status it maps to at the control-plane
/// boundary.
#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl ApiError {
  pub fn bad_request(message: impl Into<String>) -> Self {
    Self {
      status: StatusCode::BAD_REQUEST,
      message: message.into(),
    }
  }

  pub fn unauthorized() -> Self {
    Self {
      status: StatusCode::UNAUTHORIZED,
      message: "Unauthorized".to_owned(),
    }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self {
      status: StatusCode::NOT_FOUND,
      message: message.into(),
    }
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self {
      status: StatusCode::INTERNAL_SERVER_ERROR,
      message: message.into(),
    }
  }

  /// 501: the deployment has no allocation path configured at all.
  pub fn not_implemented(message: impl Into<String>) -> Self {
    Self {
      status: StatusCode::NOT_IMPLEMENTED,
      message: message.into(),
    }
  }

  /// 502: the bridge (or another upstream) failed or is protocol-incompatible.
  pub fn bad_gateway(message: impl Into<String>) -> Self {
    Self {
      status: StatusCode::BAD_GATEWAY,
      message: message.into(),
    }
  }

  /// 503: a dependency exists but is not ready yet.
  pub fn unavailable(message: impl Into<String>) -> Self {
    Self {
      status: StatusCode::SERVICE_UNAVAILABLE,
      message: message.into(),
    }
  }
}

impl std::fmt::Display for ApiError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {}", self.status, self.message)
  }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(json!({"detail": self.message}))).into_response()
  }
}
