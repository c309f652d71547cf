//! Exercise mastery state machine.
//!
//! The engine is a pure function over an immutable `SessionState`: every command or
//! oracle response is an `Event`, and `SessionState::step` returns a `Transition`
//! holding the replacement state, the oracle calls to issue (`Effect`) and what the
//! learner should be told about it (`Notice`). Nothing here does I/O; the `session`
//! module runs the effects and feeds the responses back in.
//!
//! Responses carry the request id they answer. Only the response matching the single
//! pending call is applied; anything else is stale and rejected.

use serde::Serialize;
use thiserror::Error;

use crate::domain::{Evaluation, Exercise, ExerciseType};

/// Coarse phase of assessment. Ordered: `Initial < Advanced < Complete`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Initial,
    Advanced,
    Complete,
}

impl Stage {
    pub fn exercise_type(self) -> ExerciseType {
        match self {
            Stage::Initial => ExerciseType::Initial,
            Stage::Advanced | Stage::Complete => ExerciseType::Advanced,
        }
    }
}

/// What the engine is waiting on within a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ready,
    Loading,
    Answering,
    Evaluating,
    Remediation,
}

/// Kind of the single outstanding asynchronous operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Generate,
    Evaluate,
    Hint,
    Remediate,
    AdvancePause,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCall {
    pub request_id: u64,
    pub kind: CallKind,
}

/// Rules the engine applies when deciding on a verdict.
#[derive(Clone, Debug)]
pub struct MasteryPolicy {
    pub mastery_threshold: f32,
    pub max_remediation_attempts: u8,
    pub min_answer_chars: usize,
    /// Used as a degraded hint when the exercise has no expected steps.
    pub fallback_hint: String,
}

impl Default for MasteryPolicy {
    fn default() -> Self {
        Self {
            mastery_threshold: 0.8,
            max_remediation_attempts: 3,
            min_answer_chars: 1,
            fallback_hint: "Think about breaking the problem into smaller parts.".into(),
        }
    }
}

/// Everything the engine owns for one (learner, concept) session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub stage: Stage,
    pub status: Status,
    pub current_exercise: Option<Exercise>,
    pub evaluation: Option<Evaluation>,
    pub remediation_attempts: u8,
    pub completed_steps: Vec<String>,
    pub hints_used: u32,
    /// Most recent hint for the current exercise.
    pub last_hint: Option<String>,
    /// Focus of the remediation exercise currently requested or shown.
    pub remediation_focus: Option<String>,
    pub pending: Option<PendingCall>,
    pub last_error: Option<String>,
    #[serde(skip)]
    next_request_id: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            stage: Stage::Initial,
            status: Status::Ready,
            current_exercise: None,
            evaluation: None,
            remediation_attempts: 0,
            completed_steps: Vec::new(),
            hints_used: 0,
            last_hint: None,
            remediation_focus: None,
            pending: None,
            last_error: None,
            next_request_id: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    GenerateExercise,
    SubmitAnswer { response: String },
    RequestHint { context: Vec<String> },
    StartRemediation,
    Reset,
    ExerciseGenerated { request_id: u64, exercise: Exercise },
    GenerationFailed { request_id: u64, error: String },
    Evaluated { request_id: u64, evaluation: Evaluation },
    EvaluationFailed { request_id: u64, error: String },
    HintReceived { request_id: u64, hint: String },
    HintFailed { request_id: u64, error: String },
    PauseElapsed { request_id: u64 },
}

impl Event {
    /// The request a response event answers; `None` for commands.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Event::ExerciseGenerated { request_id, .. }
            | Event::GenerationFailed { request_id, .. }
            | Event::Evaluated { request_id, .. }
            | Event::EvaluationFailed { request_id, .. }
            | Event::HintReceived { request_id, .. }
            | Event::HintFailed { request_id, .. }
            | Event::PauseElapsed { request_id } => Some(*request_id),
            _ => None,
        }
    }
}

/// Work the runtime must perform; its outcome comes back as an `Event` with the same id.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Generate { request_id: u64, exercise_type: ExerciseType },
    Evaluate { request_id: u64, exercise_id: String, response: String, expected_steps: Vec<String> },
    Hint { request_id: u64, exercise_id: String, hints_used: u32, context: Vec<String> },
    Remediate { request_id: u64, focus: String },
    Pause { request_id: u64 },
}

impl Effect {
    pub fn request_id(&self) -> u64 {
        match self {
            Effect::Generate { request_id, .. }
            | Effect::Evaluate { request_id, .. }
            | Effect::Hint { request_id, .. }
            | Effect::Remediate { request_id, .. }
            | Effect::Pause { request_id } => *request_id,
        }
    }
}

/// Decision taken after a successful evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Remediate,
    Advance,
    Mastered,
    Retry,
}

/// Learner-visible consequences of a transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    ExercisePresented { exercise: Exercise, exercise_type: ExerciseType, remediation_focus: Option<String> },
    Evaluated { evaluation: Evaluation, verdict: Verdict },
    HintDelivered { number: u32, text: String, degraded: bool },
    StageAdvanced { stage: Stage },
    Mastered { completed_steps: Vec<String>, distinct_steps: usize },
    OracleFailed { call: CallKind, message: String },
    Reset,
}

/// Why an event was not applied. Never surfaced to the learner.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("a {0:?} call is already in flight")]
    Busy(CallKind),
    #[error("session is complete")]
    Complete,
    #[error("not allowed while {0:?}")]
    WrongStatus(Status),
    #[error("answer shorter than {0} characters")]
    AnswerTooShort(usize),
    #[error("response {0} does not match the pending call")]
    StaleResponse(u64),
}

#[derive(Clone, Debug)]
pub struct Transition {
    pub state: SessionState,
    pub effects: Vec<Effect>,
    pub notices: Vec<Notice>,
    pub rejection: Option<Rejection>,
}

impl Transition {
    fn applied(state: SessionState) -> Self {
        Self { state, effects: Vec::new(), notices: Vec::new(), rejection: None }
    }

    fn rejected(state: &SessionState, why: Rejection) -> Self {
        Self { state: state.clone(), effects: Vec::new(), notices: Vec::new(), rejection: Some(why) }
    }

    fn effect(mut self, e: Effect) -> Self {
        self.effects.push(e);
        self
    }

    fn notice(mut self, n: Notice) -> Self {
        self.notices.push(n);
        self
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn step(&self, event: Event, policy: &MasteryPolicy) -> Transition {
        match event {
            Event::Reset => self.reset(),
            Event::GenerateExercise => self.on_generate(),
            Event::SubmitAnswer { response } => self.on_submit(response, policy),
            Event::RequestHint { context } => self.on_hint_request(context),
            Event::StartRemediation => self.on_start_remediation(),
            Event::ExerciseGenerated { request_id, exercise } => self.on_exercise(request_id, exercise),
            Event::GenerationFailed { request_id, error } => self.on_generation_failed(request_id, error),
            Event::Evaluated { request_id, evaluation } => self.on_evaluated(request_id, evaluation, policy),
            Event::EvaluationFailed { request_id, error } => self.on_evaluation_failed(request_id, error),
            Event::HintReceived { request_id, hint } => self.on_hint(request_id, Some(hint), policy),
            Event::HintFailed { request_id, .. } => self.on_hint(request_id, None, policy),
            Event::PauseElapsed { request_id } => self.on_pause_elapsed(request_id),
        }
    }

    // -------- commands --------

    fn guard(&self, allowed: Status) -> Result<(), Rejection> {
        if self.stage == Stage::Complete {
            return Err(Rejection::Complete);
        }
        if let Some(p) = self.pending {
            return Err(Rejection::Busy(p.kind));
        }
        if self.status != allowed {
            return Err(Rejection::WrongStatus(self.status));
        }
        Ok(())
    }

    fn begin(&self, kind: CallKind) -> (SessionState, u64) {
        let mut next = self.clone();
        let request_id = next.next_request_id;
        next.next_request_id += 1;
        next.pending = Some(PendingCall { request_id, kind });
        (next, request_id)
    }

    fn reset(&self) -> Transition {
        let state = SessionState { next_request_id: self.next_request_id, ..SessionState::default() };
        Transition::applied(state).notice(Notice::Reset)
    }

    fn on_generate(&self) -> Transition {
        if let Err(why) = self.guard(Status::Ready) {
            return Transition::rejected(self, why);
        }
        let (mut next, request_id) = self.begin(CallKind::Generate);
        next.status = Status::Loading;
        next.last_error = None;
        let exercise_type = next.stage.exercise_type();
        Transition::applied(next).effect(Effect::Generate { request_id, exercise_type })
    }

    fn on_submit(&self, response: String, policy: &MasteryPolicy) -> Transition {
        if let Err(why) = self.guard(Status::Answering) {
            return Transition::rejected(self, why);
        }
        let min = policy.min_answer_chars.max(1);
        let response = response.trim().to_string();
        if response.chars().count() < min {
            return Transition::rejected(self, Rejection::AnswerTooShort(min));
        }
        let Some(exercise) = &self.current_exercise else {
            return Transition::rejected(self, Rejection::WrongStatus(self.status));
        };
        let (exercise_id, expected_steps) = (exercise.exercise_id.clone(), exercise.expected_steps.clone());
        let (mut next, request_id) = self.begin(CallKind::Evaluate);
        next.status = Status::Evaluating;
        next.last_error = None;
        Transition::applied(next).effect(Effect::Evaluate { request_id, exercise_id, response, expected_steps })
    }

    fn on_hint_request(&self, context: Vec<String>) -> Transition {
        if let Err(why) = self.guard(Status::Answering) {
            return Transition::rejected(self, why);
        }
        let Some(exercise) = &self.current_exercise else {
            return Transition::rejected(self, Rejection::WrongStatus(self.status));
        };
        let exercise_id = exercise.exercise_id.clone();
        let (next, request_id) = self.begin(CallKind::Hint);
        let hints_used = next.hints_used;
        Transition::applied(next).effect(Effect::Hint { request_id, exercise_id, hints_used, context })
    }

    fn on_start_remediation(&self) -> Transition {
        if let Err(why) = self.guard(Status::Remediation) {
            return Transition::rejected(self, why);
        }
        let focus = self.remediation_target();
        let (mut next, request_id) = self.begin(CallKind::Remediate);
        next.status = Status::Loading;
        next.remediation_focus = Some(focus.clone());
        next.last_error = None;
        Transition::applied(next).effect(Effect::Remediate { request_id, focus })
    }

    /// Focus named by the oracle, else the first missing step, else what the exercise expected.
    fn remediation_target(&self) -> String {
        let from_eval = self.evaluation.as_ref().and_then(|e| {
            e.remediation_focus
                .clone()
                .filter(|f| !f.trim().is_empty())
                .or_else(|| e.missing_steps.first().cloned())
        });
        from_eval
            .or_else(|| {
                self.current_exercise
                    .as_ref()
                    .and_then(|ex| ex.expected_steps.first().cloned().or_else(|| Some(ex.prompt.clone())))
            })
            .unwrap_or_default()
    }

    // -------- responses --------

    fn settle(&self, request_id: u64, kinds: &[CallKind]) -> Result<(SessionState, CallKind), Rejection> {
        match self.pending {
            Some(p) if p.request_id == request_id && kinds.contains(&p.kind) => {
                let mut next = self.clone();
                next.pending = None;
                Ok((next, p.kind))
            }
            _ => Err(Rejection::StaleResponse(request_id)),
        }
    }

    fn on_exercise(&self, request_id: u64, exercise: Exercise) -> Transition {
        let (mut next, kind) = match self.settle(request_id, &[CallKind::Generate, CallKind::Remediate]) {
            Ok(v) => v,
            Err(why) => return Transition::rejected(self, why),
        };
        if kind == CallKind::Generate {
            next.remediation_focus = None;
        }
        next.current_exercise = Some(exercise.clone());
        next.hints_used = 0;
        next.last_hint = None;
        next.evaluation = None;
        next.status = Status::Answering;
        next.last_error = None;
        let notice = Notice::ExercisePresented {
            exercise,
            exercise_type: next.stage.exercise_type(),
            remediation_focus: next.remediation_focus.clone(),
        };
        Transition::applied(next).notice(notice)
    }

    fn on_generation_failed(&self, request_id: u64, error: String) -> Transition {
        let (mut next, kind) = match self.settle(request_id, &[CallKind::Generate, CallKind::Remediate]) {
            Ok(v) => v,
            Err(why) => return Transition::rejected(self, why),
        };
        next.status = Status::Ready;
        next.last_error = Some(error.clone());
        Transition::applied(next).notice(Notice::OracleFailed { call: kind, message: error })
    }

    fn on_evaluated(&self, request_id: u64, evaluation: Evaluation, policy: &MasteryPolicy) -> Transition {
        let (mut next, _) = match self.settle(request_id, &[CallKind::Evaluate]) {
            Ok(v) => v,
            Err(why) => return Transition::rejected(self, why),
        };
        next.completed_steps.extend(evaluation.identified_steps.iter().cloned());
        next.evaluation = Some(evaluation.clone());
        next.last_error = None;

        let exhausted = next.remediation_attempts >= policy.max_remediation_attempts;
        let mastered = evaluation.competency_score >= policy.mastery_threshold;
        let verdict = if evaluation.remediation_needed && !exhausted {
            Verdict::Remediate
        } else if mastered || evaluation.remediation_needed {
            // Exhausted remediation moves forward rather than looping.
            if next.stage == Stage::Initial { Verdict::Advance } else { Verdict::Mastered }
        } else {
            Verdict::Retry
        };

        let mut t = match verdict {
            Verdict::Remediate => {
                next.status = Status::Remediation;
                next.remediation_attempts += 1;
                Transition::applied(next)
            }
            Verdict::Advance => {
                let (mut paused, request_id) = next.begin(CallKind::AdvancePause);
                paused.status = Status::Evaluating;
                Transition::applied(paused).effect(Effect::Pause { request_id })
            }
            Verdict::Mastered => {
                next.stage = Stage::Complete;
                next.status = Status::Ready;
                Transition::applied(next)
            }
            Verdict::Retry => {
                next.status = Status::Answering;
                Transition::applied(next)
            }
        };
        t = t.notice(Notice::Evaluated { evaluation, verdict });
        if verdict == Verdict::Mastered {
            let completed_steps = t.state.completed_steps.clone();
            let mut distinct: Vec<&String> = completed_steps.iter().collect();
            distinct.sort();
            distinct.dedup();
            let distinct_steps = distinct.len();
            t = t
                .notice(Notice::StageAdvanced { stage: Stage::Complete })
                .notice(Notice::Mastered { completed_steps, distinct_steps });
        }
        t
    }

    fn on_evaluation_failed(&self, request_id: u64, error: String) -> Transition {
        let (mut next, kind) = match self.settle(request_id, &[CallKind::Evaluate]) {
            Ok(v) => v,
            Err(why) => return Transition::rejected(self, why),
        };
        next.status = Status::Answering;
        next.last_error = Some(error.clone());
        Transition::applied(next).notice(Notice::OracleFailed { call: kind, message: error })
    }

    /// `hint == None` means the oracle failed; hints degrade to the expected steps.
    fn on_hint(&self, request_id: u64, hint: Option<String>, policy: &MasteryPolicy) -> Transition {
        let (mut next, _) = match self.settle(request_id, &[CallKind::Hint]) {
            Ok(v) => v,
            Err(why) => return Transition::rejected(self, why),
        };
        let (text, degraded) = match hint.filter(|h| !h.trim().is_empty()) {
            Some(h) => (h, false),
            None => (next.fallback_hint(policy), true),
        };
        next.hints_used += 1;
        next.last_hint = Some(text.clone());
        let number = next.hints_used;
        Transition::applied(next).notice(Notice::HintDelivered { number, text, degraded })
    }

    fn fallback_hint(&self, policy: &MasteryPolicy) -> String {
        let steps = self.current_exercise.as_ref().map(|e| e.expected_steps.as_slice()).unwrap_or(&[]);
        match steps.len() {
            0 => policy.fallback_hint.clone(),
            n => steps[(self.hints_used as usize).min(n - 1)].clone(),
        }
    }

    fn on_pause_elapsed(&self, request_id: u64) -> Transition {
        let (mut next, _) = match self.settle(request_id, &[CallKind::AdvancePause]) {
            Ok(v) => v,
            Err(why) => return Transition::rejected(self, why),
        };
        next.stage = Stage::Advanced;
        next.status = Status::Ready;
        Transition::applied(next).notice(Notice::StageAdvanced { stage: Stage::Advanced })
    }
}
