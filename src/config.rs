//! Loading engine configuration (policy constants, chat pacing, message templates) from TOML.
//!
//! See `EngineConfig` for the expected schema. Every table and field is optional;
//! missing values fall back to the defaults below.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::engine::MasteryPolicy;

/// Upper bound on remediation rounds per session, whatever the config says.
pub const MAX_REMEDIATION_ATTEMPTS: u8 = 3;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct EngineConfig {
  #[serde(default)]
  pub engine: EngineSettings,
  #[serde(default)]
  pub chat: ChatSettings,
  #[serde(default)]
  pub oracle: OracleSettings,
  #[serde(default)]
  pub messages: Messages,
}

/// Mastery rules. The defaults are the product rules; override only for experiments.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
  pub mastery_threshold: f32,
  pub max_remediation_attempts: u8,
  pub advance_pause_ms: u64,
  /// Minimum answer length for the form variant (chat only requires non-empty).
  pub form_min_answer_chars: usize,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      mastery_threshold: 0.8,
      max_remediation_attempts: 3,
      advance_pause_ms: 2000,
      form_min_answer_chars: 50,
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
  pub help_keywords: Vec<String>,
  pub thinking_steps: Vec<String>,
  pub thinking_interval_ms: u64,
}

impl Default for ChatSettings {
  fn default() -> Self {
    Self {
      help_keywords: ["help", "hint", "stuck", "confused", "?", "how do", "what should"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      thinking_steps: [
        "Analyzing your response...",
        "Checking conceptual understanding...",
        "Evaluating problem-solving approach...",
        "Generating personalized feedback...",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      thinking_interval_ms: 800,
    }
  }
}

impl ChatSettings {
  pub fn thinking_interval(&self) -> Duration {
    Duration::from_millis(self.thinking_interval_ms)
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
  pub timeout_ms: u64,
}

impl Default for OracleSettings {
  fn default() -> Self {
    Self { timeout_ms: 20_000 }
  }
}

impl OracleSettings {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

/// Learner-facing texts rendered into chat turns. `{placeholders}` are filled by `chat`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Messages {
  pub exercise_intro_template: String,
  pub remediation_intro_template: String,
  pub step_ack: String,
  pub hint_template: String,
  pub hint_fallback: String,
  pub evaluation_template: String,
  pub missing_steps_header: String,
  pub verdict_remediation: String,
  pub verdict_advance: String,
  pub verdict_mastered: String,
  pub verdict_retry: String,
  pub advanced_ready: String,
  pub mastery_summary_template: String,
  pub generate_failed: String,
  pub evaluate_failed: String,
  pub remediate_failed: String,
}

impl Default for Messages {
  fn default() -> Self {
    Self {
      exercise_intro_template: "**{label} Exercise**\n\n{prompt}\n\n*This {category} exercise connects to your interest in {interest}*\n\nTake your time to think through this step-by-step. You can submit individual steps to build your answer, get hints if you need guidance, or submit your complete answer when ready.".into(),
      remediation_intro_template: "Let's work on **{focus}** together.\n\n{prompt}\n\nI'll guide you through this step by step. Take it slow and think out loud - share your thought process as we work through this together.".into(),
      step_ack: "Good step! Keep building your solution. You can continue adding steps, get a hint, or submit your complete answer when ready.".into(),
      hint_template: "💡 **Hint {number}**\n\n{hint}\n\nTry applying this guidance to move forward with your solution.".into(),
      hint_fallback: "Think about breaking the problem into smaller parts.".into(),
      evaluation_template: "**Assessment Complete**\n\n**What you did well:**\n{feedback}\n\n**Understanding Score:** {score}%\n**Steps Identified:** {correct} of {total}\n{missing}\n{verdict}".into(),
      missing_steps_header: "**Areas to strengthen:**".into(),
      verdict_remediation: "Let's work together to strengthen your understanding with some targeted practice.".into(),
      verdict_advance: "Excellent work! You're ready for the advanced challenge.".into(),
      verdict_mastered: "Outstanding! You've mastered this concept.".into(),
      verdict_retry: "Feel free to try again or ask for hints to improve your approach.".into(),
      advanced_ready: "🎉 Ready for the advanced challenge? Click below to continue!".into(),
      mastery_summary_template: "You demonstrated {distinct} distinct steps while working on this concept:\n{steps}".into(),
      generate_failed: "Sorry, I encountered an error generating the exercise. Please try again.".into(),
      evaluate_failed: "Sorry, I encountered an error evaluating your response. Please try again.".into(),
      remediate_failed: "I couldn't prepare a practice exercise for that step just now. Start a new exercise when you're ready and we'll keep going from there.".into(),
    }
  }
}

impl EngineConfig {
  /// Policy for a session; `min_answer_chars` depends on the presentation variant.
  pub fn policy(&self, min_answer_chars: usize) -> MasteryPolicy {
    MasteryPolicy {
      mastery_threshold: self.engine.mastery_threshold,
      max_remediation_attempts: self.engine.max_remediation_attempts.min(MAX_REMEDIATION_ATTEMPTS),
      min_answer_chars,
      fallback_hint: self.messages.hint_fallback.clone(),
    }
  }

  pub fn advance_pause(&self) -> Duration {
    Duration::from_millis(self.engine.advance_pause_ms)
  }
}

/// Parse a TOML document into `EngineConfig`.
pub fn parse_engine_config(s: &str) -> Result<EngineConfig, toml::de::Error> {
  toml::from_str::<EngineConfig>(s)
}

/// Attempt to load `EngineConfig` from ENGINE_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_engine_config_from_env() -> Option<EngineConfig> {
  let path = std::env::var("ENGINE_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_engine_config(&s) {
      Ok(cfg) => {
        info!(target: "mastery_backend", %path, "Loaded engine config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "mastery_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "mastery_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}
