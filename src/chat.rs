//! Chat-turn log for the conversational variant.
//!
//! The log is append-only from the learner's point of view. The only mutation of an
//! existing turn is the transient "thinking" placeholder, which cycles through progress
//! messages and is then swapped for the turns produced by the call it stood in for.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Messages;
use crate::engine::{CallKind, Notice, Stage, Verdict};
use crate::util::{bullet_list, fill_template};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
  System,
  Student,
  Assistant,
  Thinking,
  Step,
  Evaluation,
  Hint,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
  pub id: Uuid,
  pub kind: TurnKind,
  pub content: String,
  pub timestamp: DateTime<Utc>,
  /// Set on thinking placeholders: the oracle request they stand in for.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub request_id: Option<u64>,
}

impl Turn {
  fn new(kind: TurnKind, content: String) -> Self {
    Self { id: Uuid::new_v4(), kind, content, timestamp: Utc::now(), request_id: None }
  }
}

#[derive(Clone, Debug, Default)]
pub struct ChatLog {
  turns: Vec<Turn>,
}

impl ChatLog {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn turns(&self) -> &[Turn] {
    &self.turns
  }

  pub fn push(&mut self, kind: TurnKind, content: impl Into<String>) {
    self.turns.push(Turn::new(kind, content.into()));
  }

  pub fn clear(&mut self) {
    self.turns.clear();
  }

  pub fn begin_thinking(&mut self, request_id: u64, first: &str) {
    let mut t = Turn::new(TurnKind::Thinking, first.to_string());
    t.request_id = Some(request_id);
    self.turns.push(t);
  }

  /// Update the placeholder text. Returns false once the placeholder is gone.
  pub fn advance_thinking(&mut self, request_id: u64, content: &str) -> bool {
    match self.thinking_index(request_id) {
      Some(i) => {
        self.turns[i].content = content.to_string();
        true
      }
      None => false,
    }
  }

  /// Drop the placeholder for `request_id` (if any) and append the resulting turns.
  pub fn settle(&mut self, request_id: u64, produced: Vec<(TurnKind, String)>) {
    if let Some(i) = self.thinking_index(request_id) {
      self.turns.remove(i);
    }
    self.turns.extend(produced.into_iter().map(|(k, c)| Turn::new(k, c)));
  }

  /// Drop every placeholder, e.g. when the calls they belong to were aborted.
  pub fn drop_thinking(&mut self) {
    self.turns.retain(|t| t.kind != TurnKind::Thinking);
  }

  /// What the learner has written so far (student and step turns), oldest first.
  pub fn student_context(&self) -> Vec<String> {
    self.turns
      .iter()
      .filter(|t| matches!(t.kind, TurnKind::Student | TurnKind::Step))
      .map(|t| t.content.clone())
      .collect()
  }

  fn thinking_index(&self, request_id: u64) -> Option<usize> {
    self.turns
      .iter()
      .position(|t| t.kind == TurnKind::Thinking && t.request_id == Some(request_id))
  }
}

/// Case-insensitive containment of any help keyword.
pub fn is_help_request(text: &str, keywords: &[String]) -> bool {
  let lower = text.to_lowercase();
  keywords.iter().any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
}

/// Calls that get a thinking placeholder while in flight.
pub fn shows_thinking(kind: CallKind) -> bool {
  matches!(kind, CallKind::Evaluate | CallKind::Hint | CallKind::Remediate)
}

/// Turns a notice contributes to the log.
pub fn render_notice(notice: &Notice, messages: &Messages) -> Vec<(TurnKind, String)> {
  match notice {
    Notice::ExercisePresented { exercise, exercise_type, remediation_focus } => match remediation_focus {
      Some(focus) => vec![(
        TurnKind::Assistant,
        fill_template(&messages.remediation_intro_template, &[("focus", focus), ("prompt", &exercise.prompt)]),
      )],
      None => vec![(
        TurnKind::System,
        fill_template(
          &messages.exercise_intro_template,
          &[
            ("label", exercise_type.label()),
            ("prompt", &exercise.prompt),
            ("category", exercise.life_category.as_str()),
            ("interest", &exercise.personalization_context.selected_interest),
          ],
        ),
      )],
    },
    Notice::Evaluated { evaluation, verdict } => {
      let missing = if evaluation.missing_steps.is_empty() {
        String::new()
      } else {
        format!("\n{}\n{}\n", messages.missing_steps_header, bullet_list(&evaluation.missing_steps))
      };
      let verdict_text = match verdict {
        Verdict::Remediate => messages.verdict_remediation.as_str(),
        Verdict::Advance => messages.verdict_advance.as_str(),
        Verdict::Mastered => messages.verdict_mastered.as_str(),
        Verdict::Retry => "",
      };
      let score = ((evaluation.competency_score * 100.0).round() as i64).to_string();
      let correct = evaluation.steps_correct.to_string();
      let total = evaluation.steps_total.to_string();
      let summary = fill_template(
        &messages.evaluation_template,
        &[
          ("feedback", &evaluation.feedback),
          ("score", &score),
          ("correct", &correct),
          ("total", &total),
          ("missing", &missing),
          ("verdict", verdict_text),
        ],
      );
      let mut out = vec![(TurnKind::Evaluation, summary.trim_end().to_string())];
      if *verdict == Verdict::Retry {
        out.push((TurnKind::Assistant, messages.verdict_retry.clone()));
      }
      out
    }
    Notice::HintDelivered { number, text, .. } => {
      let n = number.to_string();
      vec![(TurnKind::Hint, fill_template(&messages.hint_template, &[("number", &n), ("hint", text)]))]
    }
    Notice::StageAdvanced { stage: Stage::Advanced } => vec![(TurnKind::System, messages.advanced_ready.clone())],
    Notice::StageAdvanced { .. } => vec![],
    Notice::Mastered { completed_steps, distinct_steps } => {
      let mut distinct: Vec<String> = Vec::new();
      for s in completed_steps {
        if !distinct.contains(s) {
          distinct.push(s.clone());
        }
      }
      let n = distinct_steps.to_string();
      let steps = bullet_list(&distinct);
      vec![(TurnKind::System, fill_template(&messages.mastery_summary_template, &[("distinct", &n), ("steps", &steps)]))]
    }
    Notice::OracleFailed { call, .. } => match call {
      CallKind::Generate => vec![(TurnKind::System, messages.generate_failed.clone())],
      CallKind::Evaluate => vec![(TurnKind::System, messages.evaluate_failed.clone())],
      CallKind::Remediate => vec![(TurnKind::System, messages.remediate_failed.clone())],
      CallKind::Hint | CallKind::AdvancePause => vec![],
    },
    Notice::Reset => vec![],
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ChatSettings;
  use crate::domain::fixtures::{evaluation, exercise};
  use crate::domain::ExerciseType;

  fn keywords() -> Vec<String> {
    ChatSettings::default().help_keywords
  }

  #[test]
  fn help_requests_are_detected_case_insensitively() {
    assert!(is_help_request("can you help me?", &keywords()));
    assert!(is_help_request("I'm STUCK on this", &keywords()));
    assert!(is_help_request("How do I start", &keywords()));
    assert!(is_help_request("what should come next", &keywords()));
    assert!(is_help_request("is it 4?", &keywords()));
    assert!(!is_help_request("Let m be the number of months", &keywords()));
    assert!(!is_help_request("anything", &[String::new()]));
  }

  #[test]
  fn settle_swaps_placeholder_for_result() {
    let mut log = ChatLog::new();
    log.push(TurnKind::Student, "x = 6");
    log.begin_thinking(7, "Thinking...");
    assert!(log.advance_thinking(7, "Analyzing your response..."));
    assert_eq!(log.turns()[1].content, "Analyzing your response...");

    log.settle(7, vec![(TurnKind::Evaluation, "Assessment Complete".into())]);
    let kinds: Vec<TurnKind> = log.turns().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TurnKind::Student, TurnKind::Evaluation]);
    assert!(!log.advance_thinking(7, "late tick"));
  }

  #[test]
  fn settle_without_placeholder_still_appends() {
    let mut log = ChatLog::new();
    log.settle(3, vec![(TurnKind::System, "Welcome".into())]);
    assert_eq!(log.turns().len(), 1);
  }

  #[test]
  fn student_context_includes_steps_only_from_learner() {
    let mut log = ChatLog::new();
    log.push(TurnKind::System, "exercise");
    log.push(TurnKind::Step, "let m be months");
    log.push(TurnKind::Assistant, "Good step!");
    log.push(TurnKind::Student, "m = 6");
    assert_eq!(log.student_context(), vec!["let m be months", "m = 6"]);
  }

  #[test]
  fn exercise_intro_states_personalization() {
    let notice = Notice::ExercisePresented {
      exercise: exercise("ex-1"),
      exercise_type: ExerciseType::Advanced,
      remediation_focus: None,
    };
    let turns = render_notice(&notice, &Messages::default());
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].0, TurnKind::System);
    assert!(turns[0].1.starts_with("**Advanced Exercise**"));
    assert!(turns[0].1.contains("personal exercise connects to your interest in cycling"));
  }

  #[test]
  fn remediation_intro_names_focus() {
    let notice = Notice::ExercisePresented {
      exercise: exercise("rem"),
      exercise_type: ExerciseType::Initial,
      remediation_focus: Some("Isolate the variable".into()),
    };
    let turns = render_notice(&notice, &Messages::default());
    assert!(turns[0].1.starts_with("Let's work on **Isolate the variable** together."));
  }

  #[test]
  fn evaluation_summary_lists_missing_steps() {
    let notice = Notice::Evaluated { evaluation: evaluation(0.456, true, &["Write the equation"]), verdict: Verdict::Remediate };
    let turns = render_notice(&notice, &Messages::default());
    assert_eq!(turns.len(), 1);
    let text = &turns[0].1;
    assert!(text.contains("**Understanding Score:** 46%"));
    assert!(text.contains("**Steps Identified:** 1 of 3"));
    assert!(text.contains("• Isolate the variable"));
    assert!(text.ends_with("targeted practice."));
  }

  #[test]
  fn retry_verdict_invites_another_attempt() {
    let notice = Notice::Evaluated { evaluation: evaluation(0.5, false, &[]), verdict: Verdict::Retry };
    let turns = render_notice(&notice, &Messages::default());
    assert_eq!(turns.len(), 2);
    assert!(!turns[0].1.contains("Areas to strengthen"));
    assert_eq!(turns[1], (TurnKind::Assistant, Messages::default().verdict_retry));
  }

  #[test]
  fn hint_and_summary_rendering() {
    let hint = render_notice(&Notice::HintDelivered { number: 2, text: "Subtract 15".into(), degraded: true }, &Messages::default());
    assert!(hint[0].1.starts_with("💡 **Hint 2**\n\nSubtract 15"));

    let summary = render_notice(
      &Notice::Mastered { completed_steps: vec!["a".into(), "b".into(), "a".into()], distinct_steps: 2 },
      &Messages::default(),
    );
    assert!(summary[0].1.contains("2 distinct steps"));
    assert!(summary[0].1.ends_with("• a\n• b"));
  }

  #[test]
  fn hint_failures_render_nothing() {
    let n = Notice::OracleFailed { call: CallKind::Hint, message: "x".into() };
    assert!(render_notice(&n, &Messages::default()).is_empty());
  }
}
