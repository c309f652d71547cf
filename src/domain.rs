//! Domain models shared by the engine, the oracle client and the wire protocol:
//! concept, learner profile, generated exercise and its evaluation.

use serde::{Deserialize, Serialize};

/// The learning unit under assessment. Immutable for one session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Concept {
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

/// Read-only learner profile, passed through unchanged into every generation call.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LearnerProfile {
  #[serde(default)] pub interests: Vec<String>,
  #[serde(default)] pub career_interests: Vec<String>,
  #[serde(default)] pub philanthropic_interests: Vec<String>,
}

/// Personalization bucket used to frame an exercise.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifeCategory {
  Personal,
  Social,
  Career,
  Philanthropic,
}

impl LifeCategory {
  pub fn as_str(self) -> &'static str {
    match self {
      LifeCategory::Personal => "personal",
      LifeCategory::Social => "social",
      LifeCategory::Career => "career",
      LifeCategory::Philanthropic => "philanthropic",
    }
  }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
  Basic,
  Intermediate,
  Advanced,
}

/// Which assessment an exercise is generated for.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExerciseType {
  Initial,
  Advanced,
}

impl ExerciseType {
  pub fn label(self) -> &'static str {
    match self {
      ExerciseType::Initial => "Initial",
      ExerciseType::Advanced => "Advanced",
    }
  }
}

/// Why this exercise was framed the way it was (chosen by the oracle).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersonalizationContext {
  pub selected_interest: String,
  pub context_type: String,
}

/// One generated prompt. Owned by the engine until replaced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
  pub exercise_id: String,
  pub prompt: String,
  #[serde(default)] pub expected_steps: Vec<String>,
  pub life_category: LifeCategory,
  pub personalization_context: PersonalizationContext,
  pub difficulty: Difficulty,
}

/// Result of scoring one learner response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
  pub evaluation_id: String,
  #[serde(default)] pub identified_steps: Vec<String>,
  #[serde(default)] pub missing_steps: Vec<String>,
  #[serde(default)] pub incorrect_steps: Vec<String>,
  pub steps_correct: u32,
  pub steps_total: u32,
  pub competency_score: f32,
  #[serde(default)] pub feedback: String,
  pub remediation_needed: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub remediation_focus: Option<String>,
}

#[cfg(test)]
pub(crate) mod fixtures {
  use super::*;

  pub fn exercise(id: &str) -> Exercise {
    Exercise {
      exercise_id: id.to_string(),
      prompt: "You save $15 and then $40 a month for a bike. When can you buy the $255 bike?".into(),
      expected_steps: vec![
        "Write the equation".into(),
        "Subtract the constant".into(),
        "Isolate the variable".into(),
      ],
      life_category: LifeCategory::Personal,
      personalization_context: PersonalizationContext {
        selected_interest: "cycling".into(),
        context_type: "hobby".into(),
      },
      difficulty: Difficulty::Basic,
    }
  }

  pub fn evaluation(score: f32, remediation: bool, identified: &[&str]) -> Evaluation {
    Evaluation {
      evaluation_id: format!("ev-{}", (score * 100.0) as u32),
      identified_steps: identified.iter().map(|s| s.to_string()).collect(),
      missing_steps: if remediation { vec!["Isolate the variable".into()] } else { vec![] },
      incorrect_steps: vec![],
      steps_correct: identified.len() as u32,
      steps_total: 3,
      competency_score: score,
      feedback: "You set up the equation clearly.".into(),
      remediation_needed: remediation,
      remediation_focus: if remediation { Some("Isolate the variable".into()) } else { None },
    }
  }
}
