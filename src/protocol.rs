//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! The browser only renders snapshots; every decision happens server-side.

use serde::{Deserialize, Serialize};

use crate::domain::{Concept, LearnerProfile};
use crate::session::{Command, Snapshot, Variant};

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    /// Must be the first message; opens the session.
    Start {
        concept: Concept,
        #[serde(rename = "studentProfile", default)]
        student_profile: LearnerProfile,
        #[serde(default)]
        variant: Variant,
    },
    Generate,
    SubmitTurn {
        text: String,
    },
    SubmitAnswer {
        text: String,
    },
    RequestHint,
    StartRemediation,
    Reset,
}

impl ClientWsMessage {
    /// The session command this message maps to, if any.
    pub fn into_command(self) -> Option<Command> {
        match self {
            ClientWsMessage::Generate => Some(Command::Generate),
            ClientWsMessage::SubmitTurn { text } => Some(Command::SubmitTurn(text)),
            ClientWsMessage::SubmitAnswer { text } => Some(Command::SubmitAnswer(text)),
            ClientWsMessage::RequestHint => Some(Command::RequestHint),
            ClientWsMessage::StartRemediation => Some(Command::StartRemediation),
            ClientWsMessage::Reset => Some(Command::Reset),
            ClientWsMessage::Ping | ClientWsMessage::Start { .. } => None,
        }
    }
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Snapshot { snapshot: Snapshot },
    Error { message: String },
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorOut {
    pub error: String,
}
