//! WebSocket upgrade + session loop. The first client message must be `start`, which
//! opens a session; after that client messages become session commands and every
//! published snapshot is pushed back. Closing the socket drops the session handle,
//! which tears the session down.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::session::{SessionHandle, SessionSpec};
use crate::state::AppState;

#[instrument(level = "info", skip(ws, state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "mastery_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;

/// Serialize and send one message. Returns false once the socket is unusable.
async fn send(sink: &mut WsSink, msg: &ServerWsMessage) -> bool {
  let out = serde_json::to_string(msg).unwrap_or_else(|e| {
    serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
  });
  if let Err(e) = sink.send(Message::Text(out)).await {
    error!(target: "mastery_backend", error = %e, "WS send error");
    return false;
  }
  true
}

fn parse(txt: &str) -> Result<ClientWsMessage, ServerWsMessage> {
  serde_json::from_str::<ClientWsMessage>(txt)
    .map_err(|e| ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) })
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
  info!(target: "mastery_backend", "WebSocket connected");
  let (mut sink, mut stream) = socket.split();

  let Some(session) = await_start(&mut sink, &mut stream, &state).await else {
    info!(target: "mastery_backend", "WebSocket closed before session start");
    return;
  };

  let mut snapshots = session.subscribe();
  let first = snapshots.borrow_and_update().clone();
  if !send(&mut sink, &ServerWsMessage::Snapshot { snapshot: first }).await {
    return;
  }

  loop {
    tokio::select! {
      changed = snapshots.changed() => {
        if changed.is_err() {
          warn!(target: "mastery_backend", "Session ended unexpectedly");
          break;
        }
        let snapshot = snapshots.borrow_and_update().clone();
        if !send(&mut sink, &ServerWsMessage::Snapshot { snapshot }).await {
          break;
        }
      }
      msg = stream.next() => match msg {
        Some(Ok(Message::Text(txt))) => {
          let reply = match parse(&txt) {
            Ok(ClientWsMessage::Ping) => Some(ServerWsMessage::Pong),
            Ok(ClientWsMessage::Start { .. }) => {
              Some(ServerWsMessage::Error { message: "Session already started.".into() })
            }
            Ok(incoming) => {
              debug!(target: "mastery_backend", ?incoming, "WS received");
              if let Some(cmd) = incoming.into_command() {
                if !session.send(cmd).await {
                  break;
                }
              }
              None
            }
            Err(reply) => Some(reply),
          };
          if let Some(reply) = reply {
            if !send(&mut sink, &reply).await {
              break;
            }
          }
        }
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        Some(Ok(_)) => {}
      },
    }
  }

  drop(session);
  info!(target: "mastery_backend", "WebSocket disconnected");
}

/// Answer pings and reject other messages until the client sends `start`.
async fn await_start(
  sink: &mut WsSink,
  stream: &mut futures_util::stream::SplitStream<WebSocket>,
  state: &AppState,
) -> Option<SessionHandle> {
  while let Some(Ok(msg)) = stream.next().await {
    let reply = match msg {
      Message::Text(txt) => match parse(&txt) {
        Ok(ClientWsMessage::Start { concept, student_profile, variant }) => {
          info!(target: "mastery_backend", concept_id = %concept.id, ?variant, "WS session start");
          return Some(state.open_session(SessionSpec { concept, profile: student_profile, variant }));
        }
        Ok(ClientWsMessage::Ping) => ServerWsMessage::Pong,
        Ok(_) => ServerWsMessage::Error { message: "Send `start` before any other message.".into() },
        Err(reply) => reply,
      },
      Message::Close(_) => return None,
      _ => continue,
    };
    if !send(sink, &reply).await {
      return None;
    }
  }
  None
}
