//! Error taxonomy for calls to the exercise oracle.
//!
//! Every variant is a transient failure from the engine's point of view: it maps to
//! the single "oracle failure" transition and never corrupts accumulated state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
  /// The service answered with a non-success status.
  #[error("oracle HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("network error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("malformed oracle response: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("oracle call timed out after {0} ms")]
  Timeout(u64),
}

impl OracleError {
  /// Build an HTTP error, preferring a clean message from a JSON error body.
  pub fn from_status(status: u16, body: &str) -> Self {
    let message = extract_error_message(body).unwrap_or_else(|| {
      let b = body.trim();
      if b.is_empty() { "no response body".to_string() } else { crate::util::trunc_for_log(b, 200) }
    });
    OracleError::Http { status, message }
  }
}

/// Accepts `{"error": "..."}`, `{"error": {"message": "..."}}` or `{"message": "..."}`.
fn extract_error_message(body: &str) -> Option<String> {
  let v: serde_json::Value = serde_json::from_str(body).ok()?;
  match v.get("error") {
    Some(serde_json::Value::String(s)) => return Some(s.clone()),
    Some(obj) => {
      if let Some(m) = obj.get("message").and_then(|m| m.as_str()) {
        return Some(m.to_string());
      }
    }
    None => {}
  }
  v.get("message").and_then(|m| m.as_str()).map(str::to_string)
}
