//! Session runtime: one task per (learner, concept) pairing.
//!
//! The actor owns the `SessionState` and (for the chat variant) the `ChatLog`. Commands
//! from the presentation layer and oracle responses are processed one at a time on the
//! actor task, so every transition sees the state left by the previous one. Effects run
//! as spawned tasks bounded by a timeout and report back through an internal channel.
//!
//! Dropping the `SessionHandle` tears the actor down and aborts everything it spawned,
//! so no response can apply to a session that no longer exists.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::chat::{is_help_request, render_notice, shows_thinking, ChatLog, Turn, TurnKind};
use crate::config::EngineConfig;
use crate::domain::{Concept, LearnerProfile};
use crate::engine::{Effect, Event, MasteryPolicy, Notice, SessionState, Status, Transition};
use crate::error::OracleError;
use crate::oracle::{EvaluateRequest, GenerateRequest, HintRequest, Oracle, RemediationRequest};

/// Presentation flavour driving the same engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Form,
    Chat,
}

/// Immutable inputs for one session.
#[derive(Clone, Debug)]
pub struct SessionSpec {
    pub concept: Concept,
    pub profile: LearnerProfile,
    pub variant: Variant,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Generate,
    /// Free-text chat turn: a help request or a step.
    SubmitTurn(String),
    SubmitAnswer(String),
    RequestHint,
    StartRemediation,
    Reset,
}

/// What the presentation layer renders.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(flatten)]
    pub state: SessionState,
    pub busy: bool,
    pub variant: Variant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns: Option<Vec<Turn>>,
}

pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    #[instrument(level = "info", skip_all, fields(concept_id = %spec.concept.id, variant = ?spec.variant))]
    pub fn spawn(spec: SessionSpec, oracle: Arc<dyn Oracle>, config: Arc<EngineConfig>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let min_answer_chars = match spec.variant {
            Variant::Form => config.engine.form_min_answer_chars,
            Variant::Chat => 1,
        };
        let log = (spec.variant == Variant::Chat).then(ChatLog::new);
        let state = SessionState::new();
        let initial = Snapshot {
            state: state.clone(),
            busy: false,
            variant: spec.variant,
            turns: log.as_ref().map(|l| l.turns().to_vec()),
        };
        let (snapshots_tx, snapshots_rx) = watch::channel(initial);

        let actor = SessionActor {
            policy: config.policy(min_answer_chars),
            runner: EffectRunner {
                oracle,
                spec: spec.clone(),
                timeout: config.oracle.timeout(),
                pause: config.advance_pause(),
            },
            spec,
            config,
            state,
            log,
            in_flight: HashMap::new(),
            pacers: HashMap::new(),
            internal_tx,
            snapshots: snapshots_tx,
        };
        info!(target: "mastery", "Session started");
        let task = tokio::spawn(actor.run(commands_rx, internal_rx));
        Self { commands: commands_tx, snapshots: snapshots_rx, task }
    }

    /// Queue a command. Returns false if the session is gone.
    pub async fn send(&self, cmd: Command) -> bool {
        self.commands.send(cmd).await.is_ok()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Internal {
    Engine(Event),
    ThinkingTick { request_id: u64, step: usize },
}

/// Everything a spawned effect needs, detached from the actor.
#[derive(Clone)]
struct EffectRunner {
    oracle: Arc<dyn Oracle>,
    spec: SessionSpec,
    timeout: Duration,
    pause: Duration,
}

impl EffectRunner {
    async fn bounded<T>(&self, fut: impl Future<Output = Result<T, OracleError>>) -> Result<T, OracleError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(OracleError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    /// Perform one effect and turn its outcome into the event that answers it.
    async fn perform(self, effect: Effect) -> Event {
        let concept = &self.spec.concept;
        match effect {
            Effect::Generate { request_id, exercise_type } => {
                let req = GenerateRequest {
                    concept_id: concept.id.clone(),
                    concept_name: concept.name.clone(),
                    concept_description: concept.description.clone(),
                    student_profile: self.spec.profile.clone(),
                    exercise_type,
                };
                match self.bounded(self.oracle.generate(&req)).await {
                    Ok(exercise) => Event::ExerciseGenerated { request_id, exercise },
                    Err(e) => Event::GenerationFailed { request_id, error: e.to_string() },
                }
            }
            Effect::Evaluate { request_id, exercise_id, response, expected_steps } => {
                let req = EvaluateRequest { exercise_id, student_response: response, expected_steps };
                match self.bounded(self.oracle.evaluate(&req)).await {
                    Ok(evaluation) => Event::Evaluated { request_id, evaluation },
                    Err(e) => Event::EvaluationFailed { request_id, error: e.to_string() },
                }
            }
            Effect::Hint { request_id, exercise_id, hints_used, context } => {
                let req = HintRequest { exercise_id, hints_used, chat_context: context };
                match self.bounded(self.oracle.hint(&req)).await {
                    Ok(r) => Event::HintReceived { request_id, hint: r.hint },
                    Err(e) => Event::HintFailed { request_id, error: e.to_string() },
                }
            }
            Effect::Remediate { request_id, focus } => {
                let req = RemediationRequest {
                    concept_id: concept.id.clone(),
                    target_step: focus,
                    student_profile: self.spec.profile.clone(),
                };
                match self.bounded(self.oracle.remediate(&req)).await {
                    Ok(exercise) => Event::ExerciseGenerated { request_id, exercise },
                    Err(e) => Event::GenerationFailed { request_id, error: e.to_string() },
                }
            }
            Effect::Pause { request_id } => {
                tokio::time::sleep(self.pause).await;
                Event::PauseElapsed { request_id }
            }
        }
    }
}

struct SessionActor {
    spec: SessionSpec,
    config: Arc<EngineConfig>,
    policy: MasteryPolicy,
    runner: EffectRunner,
    state: SessionState,
    log: Option<ChatLog>,
    in_flight: HashMap<u64, JoinHandle<()>>,
    pacers: HashMap<u64, JoinHandle<()>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    snapshots: watch::Sender<Snapshot>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut internal: mpsc::UnboundedReceiver<Internal>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some(msg) = internal.recv() => self.on_internal(msg),
            }
        }
        info!(target: "mastery", concept_id = %self.spec.concept.id, "Session closed");
    }

    fn on_command(&mut self, cmd: Command) {
        debug!(target: "mastery", ?cmd, stage = ?self.state.stage, status = ?self.state.status, "Command received");
        match cmd {
            Command::Generate => self.dispatch(Event::GenerateExercise),
            Command::SubmitAnswer(text) => {
                let t = self.state.step(Event::SubmitAnswer { response: text.clone() }, &self.policy);
                if t.rejection.is_none() {
                    if let Some(log) = &mut self.log {
                        log.push(TurnKind::Student, text.trim());
                    }
                }
                self.commit(t);
            }
            Command::SubmitTurn(text) => self.on_turn(text),
            Command::RequestHint => {
                let context = self.context();
                self.dispatch(Event::RequestHint { context });
            }
            Command::StartRemediation => self.dispatch(Event::StartRemediation),
            Command::Reset => {
                self.abort_all();
                self.dispatch(Event::Reset);
            }
        }
    }

    /// Chat turns: help requests become hint requests, anything else is a step.
    fn on_turn(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() || self.log.is_none() {
            return;
        }
        if is_help_request(&text, &self.config.chat.help_keywords) {
            let t = self.state.step(Event::RequestHint { context: self.context() }, &self.policy);
            if t.rejection.is_none() {
                if let Some(log) = &mut self.log {
                    log.push(TurnKind::Student, text);
                }
            }
            self.commit(t);
            return;
        }
        if self.state.status != Status::Answering || self.state.current_exercise.is_none() {
            debug!(target: "mastery", status = ?self.state.status, "Step ignored: no exercise to work on");
            return;
        }
        if let Some(log) = &mut self.log {
            log.push(TurnKind::Step, text);
            log.push(TurnKind::Assistant, self.config.messages.step_ack.clone());
        }
        self.publish();
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Engine(event) => {
                if let Some(id) = event.request_id() {
                    self.in_flight.remove(&id);
                }
                let t = self.state.step(event, &self.policy);
                self.commit(t);
            }
            Internal::ThinkingTick { request_id, step } => {
                let Some(text) = self.config.chat.thinking_steps.get(step) else { return };
                let updated = match &mut self.log {
                    Some(log) => log.advance_thinking(request_id, text),
                    None => false,
                };
                if updated {
                    self.publish();
                }
            }
        }
    }

    fn context(&self) -> Vec<String> {
        self.log.as_ref().map(ChatLog::student_context).unwrap_or_default()
    }

    fn dispatch(&mut self, event: Event) {
        let t = self.state.step(event, &self.policy);
        self.commit(t);
    }

    /// Replace the state, render notices, start effects, publish one snapshot.
    fn commit(&mut self, t: Transition) {
        let Transition { state, effects, notices, rejection } = t;
        if let Some(why) = rejection {
            debug!(target: "mastery", %why, "Event rejected");
            return;
        }

        let settled = self
            .state
            .pending
            .filter(|p| state.pending.map(|q| q.request_id) != Some(p.request_id))
            .map(|p| p.request_id);
        self.state = state;

        if let Some(log) = &mut self.log {
            if notices.contains(&Notice::Reset) {
                log.clear();
            }
            let produced: Vec<(TurnKind, String)> =
                notices.iter().flat_map(|n| render_notice(n, &self.config.messages)).collect();
            match settled {
                Some(id) => log.settle(id, produced),
                None => produced.into_iter().for_each(|(k, c)| log.push(k, c)),
            }
        }
        if let Some(id) = settled {
            if let Some(p) = self.pacers.remove(&id) {
                p.abort();
            }
        }
        notices.iter().for_each(|n| self.trace_notice(n));

        for effect in effects {
            self.start(effect);
        }
        self.publish();

        // The chat variant goes straight into the remediation exercise.
        if self.spec.variant == Variant::Chat && self.state.status == Status::Remediation && !self.state.is_busy() {
            self.dispatch(Event::StartRemediation);
        }
    }

    fn start(&mut self, effect: Effect) {
        let request_id = effect.request_id();
        let thinking = self.state.pending.map(|p| shows_thinking(p.kind)).unwrap_or(false);
        if thinking {
            let first = self.config.chat.thinking_steps.first().map(String::as_str).unwrap_or("Thinking...");
            if let Some(log) = &mut self.log {
                log.begin_thinking(request_id, first);
                self.spawn_pacer(request_id);
            }
        }

        let runner = self.runner.clone();
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            let event = runner.perform(effect).await;
            let _ = tx.send(Internal::Engine(event));
        });
        self.in_flight.insert(request_id, handle);
    }

    fn spawn_pacer(&mut self, request_id: u64) {
        let tx = self.internal_tx.clone();
        let interval = self.config.chat.thinking_interval();
        let steps = self.config.chat.thinking_steps.len();
        let handle = tokio::spawn(async move {
            for step in 1..steps {
                tokio::time::sleep(interval).await;
                if tx.send(Internal::ThinkingTick { request_id, step }).is_err() {
                    break;
                }
            }
        });
        self.pacers.insert(request_id, handle);
    }

    fn abort_all(&mut self) {
        for (_, h) in self.in_flight.drain().chain(self.pacers.drain()) {
            h.abort();
        }
        if let Some(log) = &mut self.log {
            log.drop_thinking();
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(Snapshot {
            state: self.state.clone(),
            busy: self.state.is_busy(),
            variant: self.spec.variant,
            turns: self.log.as_ref().map(|l| l.turns().to_vec()),
        });
    }

    fn trace_notice(&self, notice: &Notice) {
        let concept_id = &self.spec.concept.id;
        match notice {
            Notice::ExercisePresented { exercise, exercise_type, remediation_focus } => info!(
                target: "mastery", %concept_id, exercise_id = %exercise.exercise_id, ?exercise_type,
                remediation = remediation_focus.is_some(), "Exercise presented"
            ),
            Notice::Evaluated { evaluation, verdict } => info!(
                target: "mastery", %concept_id, score = evaluation.competency_score, ?verdict,
                remediation_attempts = self.state.remediation_attempts, "Response evaluated"
            ),
            Notice::HintDelivered { number, degraded, .. } => {
                info!(target: "mastery", %concept_id, number, degraded, "Hint delivered")
            }
            Notice::StageAdvanced { stage } => info!(target: "mastery", %concept_id, ?stage, "Stage advanced"),
            Notice::Mastered { distinct_steps, .. } => {
                info!(target: "mastery", %concept_id, distinct_steps, "Concept mastered")
            }
            Notice::OracleFailed { call, message } => {
                warn!(target: "mastery", %concept_id, ?call, error = %message, "Oracle call failed")
            }
            Notice::Reset => info!(target: "mastery", %concept_id, "Session reset"),
        }
    }
}

impl Drop for SessionActor {
    fn drop(&mut self) {
        for h in self.in_flight.values().chain(self.pacers.values()) {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::{evaluation, exercise};
    use crate::engine::Stage;
    use crate::oracle::scripted::ScriptedOracle;

    const LONG_ANSWER: &str = "First I write 15 + 40m = 255, then subtract 15 and divide by 40 to get m = 6.";

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.engine.advance_pause_ms = 0;
        cfg.chat.thinking_interval_ms = 5;
        cfg
    }

    fn spec(variant: Variant) -> SessionSpec {
        SessionSpec {
            concept: Concept { id: "linear-eq".into(), name: "Two-step equations".into(), description: None },
            profile: LearnerProfile { interests: vec!["cycling".into()], ..LearnerProfile::default() },
            variant,
        }
    }

    fn start(oracle: &Arc<ScriptedOracle>, variant: Variant, cfg: EngineConfig) -> SessionHandle {
        SessionHandle::spawn(spec(variant), oracle.clone(), Arc::new(cfg))
    }

    async fn wait_until(rx: &mut watch::Receiver<Snapshot>, f: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
            .await
            .expect("condition not reached in time")
            .expect("session closed")
            .clone()
    }

    async fn answering(handle: &SessionHandle, rx: &mut watch::Receiver<Snapshot>) {
        assert!(handle.send(Command::Generate).await);
        wait_until(rx, |s| s.state.status == Status::Answering).await;
    }

    #[tokio::test]
    async fn form_flow_reaches_advanced_stage() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_evaluation(Ok(evaluation(0.85, false, &["Write the equation"])));
        let handle = start(&oracle, Variant::Form, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitAnswer(LONG_ANSWER.into())).await;
        let snap = wait_until(&mut rx, |s| s.state.stage == Stage::Advanced).await;

        assert_eq!(snap.state.status, Status::Ready);
        assert_eq!(snap.state.completed_steps, vec!["Write the equation"]);
        assert!(snap.turns.is_none());
        assert_eq!(oracle.evaluate_calls.lock().unwrap()[0].student_response, LONG_ANSWER);
    }

    #[tokio::test]
    async fn double_submit_makes_one_evaluate_call() {
        let oracle = Arc::new(ScriptedOracle::with_delay(Duration::from_millis(30)));
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_evaluation(Ok(evaluation(0.5, false, &[])));
        oracle.push_evaluation(Ok(evaluation(0.5, false, &[])));
        let handle = start(&oracle, Variant::Form, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitAnswer(LONG_ANSWER.into())).await;
        handle.send(Command::SubmitAnswer(LONG_ANSWER.into())).await;
        wait_until(&mut rx, |s| s.state.evaluation.is_some() && !s.busy).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(oracle.evaluate_calls.lock().unwrap().len(), 1);
        assert_eq!(handle.snapshot().state.status, Status::Answering);
    }

    #[tokio::test]
    async fn form_variant_enforces_minimum_answer_length() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_exercise(Ok(exercise("ex-1")));
        let handle = start(&oracle, Variant::Form, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitAnswer("m = 6".into())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(oracle.evaluate_calls.lock().unwrap().is_empty());
        assert_eq!(handle.snapshot().state.status, Status::Answering);
    }

    #[tokio::test]
    async fn help_turn_becomes_single_hint_request() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_hint(Ok("Start by naming the unknown."));
        let handle = start(&oracle, Variant::Chat, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitTurn("Let m be the months".into())).await;
        handle.send(Command::SubmitTurn("can you help me?".into())).await;
        let snap = wait_until(&mut rx, |s| s.state.hints_used == 1).await;

        let calls = oracle.hint_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].chat_context, vec!["Let m be the months"]);

        let turns = snap.turns.unwrap();
        let kinds: Vec<TurnKind> = turns.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TurnKind::System, TurnKind::Step, TurnKind::Assistant, TurnKind::Student, TurnKind::Hint]
        );
        assert!(!turns.iter().any(|t| t.kind == TurnKind::Step && t.content.contains("help")));
        assert!(turns[4].content.contains("Start by naming the unknown."));
    }

    #[tokio::test]
    async fn failed_hint_falls_back_to_first_expected_step() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_hint(Err("hint service down"));
        let handle = start(&oracle, Variant::Chat, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::RequestHint).await;
        let snap = wait_until(&mut rx, |s| s.state.hints_used == 1).await;

        assert_eq!(snap.state.status, Status::Answering);
        assert_eq!(snap.state.last_error, None);
        let last = snap.turns.unwrap().pop().unwrap();
        assert_eq!(last.kind, TurnKind::Hint);
        assert!(last.content.contains("Write the equation"));
    }

    #[tokio::test]
    async fn chat_starts_remediation_with_same_profile() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_evaluation(Ok(evaluation(0.4, true, &["Write the equation"])));
        oracle.push_exercise(Ok(exercise("rem-1")));
        let handle = start(&oracle, Variant::Chat, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitAnswer("15 + 40m = 255 so m = 7".into())).await;
        let snap = wait_until(&mut rx, |s| {
            s.state.current_exercise.as_ref().map(|e| e.exercise_id.as_str()) == Some("rem-1")
        })
        .await;

        assert_eq!(snap.state.status, Status::Answering);
        assert_eq!(snap.state.remediation_attempts, 1);
        assert_eq!(snap.state.stage, Stage::Initial);
        let rem = oracle.remediation_calls.lock().unwrap()[0].clone();
        assert_eq!(rem.target_step, "Isolate the variable");
        assert_eq!(rem.student_profile, oracle.generate_calls.lock().unwrap()[0].student_profile);
        let turns = snap.turns.unwrap();
        assert!(!turns.iter().any(|t| t.kind == TurnKind::Thinking));
        assert!(turns.last().unwrap().content.starts_with("Let's work on **Isolate the variable**"));
    }

    #[tokio::test]
    async fn thinking_placeholder_is_replaced_by_evaluation() {
        let oracle = Arc::new(ScriptedOracle::with_delay(Duration::from_millis(80)));
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_evaluation(Ok(evaluation(0.6, false, &[])));
        let handle = start(&oracle, Variant::Chat, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitAnswer("m = 6".into())).await;
        let thinking = wait_until(&mut rx, |s| {
            s.turns.as_ref().map_or(false, |t| t.iter().any(|t| t.kind == TurnKind::Thinking && t.content == "Analyzing your response..."))
        })
        .await;
        assert!(thinking.busy);

        let done = wait_until(&mut rx, |s| s.state.evaluation.is_some()).await;
        let turns = done.turns.unwrap();
        assert!(!turns.iter().any(|t| t.kind == TurnKind::Thinking));
        let kinds: Vec<TurnKind> = turns.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TurnKind::System, TurnKind::Student, TurnKind::Evaluation, TurnKind::Assistant]);
    }

    #[tokio::test]
    async fn slow_oracle_times_out_into_failure() {
        let oracle = Arc::new(ScriptedOracle::with_delay(Duration::from_millis(300)));
        oracle.push_exercise(Ok(exercise("ex-1")));
        let mut cfg = config();
        cfg.oracle.timeout_ms = 20;
        let handle = start(&oracle, Variant::Chat, cfg);
        let mut rx = handle.subscribe();

        handle.send(Command::Generate).await;
        wait_until(&mut rx, |s| s.state.status == Status::Loading).await;
        let snap = wait_until(&mut rx, |s| s.state.last_error.is_some()).await;

        assert_eq!(snap.state.status, Status::Ready);
        assert!(snap.state.last_error.unwrap().contains("timed out"));
        assert_eq!(snap.turns.unwrap().last().unwrap().content, config().messages.generate_failed);
    }

    #[tokio::test]
    async fn reset_discards_in_flight_response() {
        let oracle = Arc::new(ScriptedOracle::with_delay(Duration::from_millis(50)));
        oracle.push_exercise(Ok(exercise("ex-1")));
        let handle = start(&oracle, Variant::Form, config());
        let mut rx = handle.subscribe();

        handle.send(Command::Generate).await;
        wait_until(&mut rx, |s| s.state.status == Status::Loading).await;
        handle.send(Command::Reset).await;
        wait_until(&mut rx, |s| s.state.status == Status::Ready && !s.busy).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snap = handle.snapshot();
        assert_eq!(snap.state.status, Status::Ready);
        assert!(snap.state.current_exercise.is_none());
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_all_transitions() {
        let oracle = Arc::new(ScriptedOracle::with_delay(Duration::from_millis(50)));
        oracle.push_exercise(Ok(exercise("ex-1")));
        let handle = start(&oracle, Variant::Form, config());
        let mut rx = handle.subscribe();

        handle.send(Command::Generate).await;
        wait_until(&mut rx, |s| s.state.status == Status::Loading).await;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(rx.borrow().state.status, Status::Loading);
        assert!(rx.changed().await.is_err());
    }

    #[tokio::test]
    async fn form_snapshot_carries_hint_text() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_hint(Ok("Start by naming the unknown."));
        let handle = start(&oracle, Variant::Form, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::RequestHint).await;
        let snap = wait_until(&mut rx, |s| s.state.hints_used == 1).await;

        assert_eq!(snap.state.last_hint.as_deref(), Some("Start by naming the unknown."));
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["lastHint"], "Start by naming the unknown.");
        assert!(v.get("turns").is_none());
    }

    #[tokio::test]
    async fn failed_chat_remediation_points_back_to_a_new_exercise() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_evaluation(Ok(evaluation(0.4, true, &[])));
        oracle.push_exercise(Err("remediation service down"));
        oracle.push_exercise(Ok(exercise("ex-2")));
        let cfg = config();
        let handle = start(&oracle, Variant::Chat, cfg.clone());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitAnswer("m = 7".into())).await;
        let failed = wait_until(&mut rx, |s| s.state.last_error.is_some()).await;

        assert_eq!(failed.state.status, Status::Ready);
        assert_eq!(oracle.remediation_calls.lock().unwrap().len(), 1);
        let turns = failed.turns.unwrap();
        assert!(!turns.iter().any(|t| t.kind == TurnKind::Thinking));
        let last = turns.last().unwrap();
        assert_eq!(last.content, cfg.messages.remediate_failed);
        assert!(!last.content.contains('?'));

        handle.send(Command::Generate).await;
        let recovered = wait_until(&mut rx, |s| {
            s.state.current_exercise.as_ref().map(|e| e.exercise_id.as_str()) == Some("ex-2")
        })
        .await;
        assert_eq!(recovered.state.status, Status::Answering);
        assert_eq!(recovered.state.remediation_attempts, 1);
    }

    #[tokio::test]
    async fn thinking_placeholder_is_dropped_when_calls_fail() {
        let oracle = Arc::new(ScriptedOracle::with_delay(Duration::from_millis(30)));
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_evaluation(Err("evaluator down"));
        oracle.push_hint(Err("hint service down"));
        let handle = start(&oracle, Variant::Chat, config());
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitAnswer("m = 6".into())).await;
        wait_until(&mut rx, |s| s.turns.as_ref().map_or(false, |t| t.iter().any(|t| t.kind == TurnKind::Thinking))).await;
        let failed = wait_until(&mut rx, |s| s.state.last_error.is_some()).await;
        let turns = failed.turns.unwrap();
        assert!(!turns.iter().any(|t| t.kind == TurnKind::Thinking));
        assert_eq!(turns.last().unwrap().content, config().messages.evaluate_failed);

        handle.send(Command::RequestHint).await;
        let hinted = wait_until(&mut rx, |s| s.state.hints_used == 1).await;
        let turns = hinted.turns.unwrap();
        assert!(!turns.iter().any(|t| t.kind == TurnKind::Thinking));
        assert_eq!(turns.last().unwrap().kind, TurnKind::Hint);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let later = handle.snapshot().turns.unwrap();
        assert_eq!(later.len(), turns.len());
        assert!(!later.iter().any(|t| t.kind == TurnKind::Thinking));
    }

    #[tokio::test]
    async fn placeholder_opens_with_first_progress_message() {
        let oracle = Arc::new(ScriptedOracle::with_delay(Duration::from_millis(50)));
        oracle.push_exercise(Ok(exercise("ex-1")));
        oracle.push_evaluation(Ok(evaluation(0.6, false, &[])));
        let mut cfg = config();
        cfg.chat.thinking_interval_ms = 60_000;
        let handle = start(&oracle, Variant::Chat, cfg);
        let mut rx = handle.subscribe();

        answering(&handle, &mut rx).await;
        handle.send(Command::SubmitAnswer("m = 6".into())).await;
        let snap = wait_until(&mut rx, |s| s.busy).await;

        let placeholder = snap.turns.unwrap().pop().unwrap();
        assert_eq!(placeholder.kind, TurnKind::Thinking);
        assert_eq!(placeholder.content, "Analyzing your response...");
    }
}
