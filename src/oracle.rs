//! Client for the external exercise oracle (generation, evaluation, hints, remediation).
//!
//! The engine only depends on the `Oracle` trait; `HttpOracle` speaks the JSON-over-HTTP
//! contract of the hosted exercise service. Calls are instrumented and log latencies and
//! payload sizes (not learner answers).
//!
//! NOTE: We never log the bearer token.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::domain::{Evaluation, Exercise, ExerciseType, LearnerProfile};
use crate::error::OracleError;

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
  pub concept_id: String,
  pub concept_name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub concept_description: Option<String>,
  pub student_profile: LearnerProfile,
  pub exercise_type: ExerciseType,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
  pub exercise_id: String,
  pub student_response: String,
  pub expected_steps: Vec<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HintRequest {
  pub exercise_id: String,
  pub hints_used: u32,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub chat_context: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HintResponse {
  pub hint: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequest {
  pub concept_id: String,
  /// The step the remediation exercise should target.
  pub target_step: String,
  pub student_profile: LearnerProfile,
}

/// Opaque scoring capability. Implementations may fail; the session maps any error to
/// the engine's oracle-failure transition.
#[async_trait]
pub trait Oracle: Send + Sync {
  async fn generate(&self, req: &GenerateRequest) -> Result<Exercise, OracleError>;
  async fn evaluate(&self, req: &EvaluateRequest) -> Result<Evaluation, OracleError>;
  async fn hint(&self, req: &HintRequest) -> Result<HintResponse, OracleError>;
  async fn remediate(&self, req: &RemediationRequest) -> Result<Exercise, OracleError>;
  /// Prior exercise records for a concept, passed through as-is.
  async fn history(&self, concept_id: &str) -> Result<Vec<serde_json::Value>, OracleError>;
}

#[derive(Clone)]
pub struct HttpOracle {
  pub client: reqwest::Client,
  pub base_url: String,
  token: Option<String>,
}

impl HttpOracle {
  pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, OracleError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let base_url = base_url.into().trim_end_matches('/').to_string();
    Ok(Self { client, base_url, token })
  }

  /// Construct from ORACLE_BASE_URL / ORACLE_TOKEN.
  pub fn from_env(timeout: Duration) -> Result<Self, OracleError> {
    let base_url =
      std::env::var("ORACLE_BASE_URL").unwrap_or_else(|_| "http://localhost:8000/api/exercise".into());
    let token = std::env::var("ORACLE_TOKEN").ok().filter(|t| !t.is_empty());
    Self::new(base_url, token, timeout)
  }

  pub fn has_token(&self) -> bool {
    self.token.is_some()
  }

  fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    let builder = builder
      .header(USER_AGENT, "mastery-backend/0.1")
      .header(CONTENT_TYPE, "application/json");
    match &self.token {
      Some(t) => builder.header(AUTHORIZATION, format!("Bearer {}", t)),
      None => builder,
    }
  }

  async fn read<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, OracleError> {
    let status = res.status();
    let body = res.text().await?;
    if !status.is_success() {
      return Err(OracleError::from_status(status.as_u16(), &body));
    }
    Ok(serde_json::from_str::<T>(&body)?)
  }

  #[instrument(level = "info", skip(self, body), fields(%path))]
  async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, OracleError> {
    let url = format!("{}/{}", self.base_url, path);
    let start = Instant::now();
    let result = match self.request(self.client.post(&url)).json(body).send().await {
      Ok(res) => Self::read::<T>(res).await,
      Err(e) => Err(OracleError::from(e)),
    };
    let elapsed = start.elapsed();
    match &result {
      Ok(_) => info!(target: "oracle", ?elapsed, "Oracle response received"),
      Err(e) => error!(target: "oracle", ?elapsed, error = %e, "Oracle call failed"),
    }
    result
  }
}

#[async_trait]
impl Oracle for HttpOracle {
  #[instrument(level = "info", skip(self, req), fields(concept_id = %req.concept_id, exercise_type = ?req.exercise_type))]
  async fn generate(&self, req: &GenerateRequest) -> Result<Exercise, OracleError> {
    let ex: Exercise = self.post_json("generate", req).await?;
    info!(
      target: "oracle",
      exercise_id = %ex.exercise_id,
      life_category = ?ex.life_category,
      interest = %ex.personalization_context.selected_interest,
      prompt_preview = %ex.prompt.chars().take(40).collect::<String>(),
      "Exercise generated"
    );
    Ok(ex)
  }

  #[instrument(level = "info", skip(self, req), fields(exercise_id = %req.exercise_id, answer_len = req.student_response.len()))]
  async fn evaluate(&self, req: &EvaluateRequest) -> Result<Evaluation, OracleError> {
    let ev: Evaluation = self.post_json("evaluate", req).await?;
    info!(target: "oracle", evaluation_id = %ev.evaluation_id, score = ev.competency_score, remediation = ev.remediation_needed, "Response evaluated");
    Ok(ev)
  }

  #[instrument(level = "info", skip(self, req), fields(exercise_id = %req.exercise_id, hints_used = req.hints_used, context_len = req.chat_context.len()))]
  async fn hint(&self, req: &HintRequest) -> Result<HintResponse, OracleError> {
    self.post_json("hint", req).await
  }

  #[instrument(level = "info", skip(self, req), fields(concept_id = %req.concept_id, target_step = %req.target_step))]
  async fn remediate(&self, req: &RemediationRequest) -> Result<Exercise, OracleError> {
    self.post_json("remediation", req).await
  }

  #[instrument(level = "info", skip(self), fields(%concept_id))]
  async fn history(&self, concept_id: &str) -> Result<Vec<serde_json::Value>, OracleError> {
    let url = format!("{}/history/{}", self.base_url, concept_id);
    let res = self.request(self.client.get(&url)).send().await?;
    Self::read(res).await
  }
}
