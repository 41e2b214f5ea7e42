//! Structured error types for the crash aggregator.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("parse: {0}")]
  Parse(String),

  #[error("callstack: {0}")]
  CallStack(String),

  #[error("unknown user segment: {0}")]
  UnknownSegment(String),

  #[error("store: {0}")]
  Store(String),

  #[error("tracker: {0}")]
  Tracker(String),

  #[error("tracker: no response within {0:?}")]
  TrackerTimeout(Duration),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl EngineError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn parse(msg: impl Into<String>) -> Self {
    Self::Parse(msg.into())
  }

  pub fn store(msg: impl Into<String>) -> Self {
    Self::Store(msg.into())
  }

  pub fn tracker(msg: impl Into<String>) -> Self {
    Self::Tracker(msg.into())
  }
}
