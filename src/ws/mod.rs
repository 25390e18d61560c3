//! WebSocket transport for live sessions.
//!
//! ## Connection lifecycle
//!
//! 1. The index page embeds a session token. The client connects to
//!    `GET /rio/ws?sessionToken=<token>`. The upgrade waits while the
//!    [`ConnectionGate`](crate::gate::ConnectionGate) is blocked; if it stays
//!    blocked past `gate_wait_timeout_secs` the socket is accepted and closed
//!    with code `3001`.
//! 2. The token is promoted:
//!    - **latent**: the first text frame must be the initial client message
//!      (JSON, within `initial_message_timeout_secs`). A new session is
//!      navigated to the client's URL, registered, and bootstrapped.
//!    - **active**: the existing session is resumed and resends its full
//!      state.
//!    - **unknown**: close code `3000` "Invalid session token.".
//! 3. While active, every text frame is JSON for the application and counts
//!    as an interaction for idle expiry.
//! 4. Close code `1001` from the client means it navigated away: the session
//!    is closed and removed. Any other disconnect keeps the session around
//!    for a reconnect with the same token.
//!
//! ## Close codes (server → client)
//!
//! | Code   | Meaning                                  |
//! |--------|------------------------------------------|
//! | `1000` | session closed by the server             |
//! | `1002` | initial message was not valid            |
//! | `1011` | navigation to the initial page failed    |
//! | `3000` | invalid session token                    |
//! | `3001` | server is not accepting new sessions     |

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{GateError, CLOSE_GOING_AWAY, CLOSE_INVALID_TOKEN, CLOSE_NOT_ACCEPTING};
use crate::sessions::session::{AttachedConnection, BootstrapKind, Frame, InitialClientMessage, Session};
use crate::sessions::{LatentEntry, Promotion};
use crate::util::token_prefix;
use crate::AppState;

const CLOSE_PROTOCOL_ERROR: u16 = 1002;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// How long the send task may take to flush after the serve loop ended.
const SEND_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(rename = "sessionToken")]
    pub session_token: String,
}

/// Where a connection is in its handshake. Used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingUpgrade,
    AwaitingInitialMessage,
    Active,
    Disconnected,
    Closed,
}

/// Why a serve loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeEnd {
    /// The client sent close code 1001.
    NavigatedAway,
    /// Session closed or a newer connection took over.
    Cancelled,
    /// Socket error or any other close.
    Disconnected,
}

/// `GET /rio/ws?sessionToken=<token>`: WebSocket upgrade handler.
///
/// Holds the upgrade until the connection gate is open (bounded).
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.session_token;
    debug!(
        token = token_prefix(&token),
        state = ?HandshakeState::AwaitingUpgrade,
        "Websocket upgrade requested"
    );
    let admitted = state
        .gate
        .await_open_for(state.config.server.gate_wait_timeout())
        .await;
    ws.on_upgrade(move |socket| handle_ws(socket, state, token, admitted))
}

async fn handle_ws(socket: WebSocket, state: AppState, token: String, admitted: bool) {
    let (mut sink, mut stream) = socket.split();

    if !admitted {
        warn!(
            token = token_prefix(&token),
            "Connection gate stayed closed, turning client away"
        );
        close_with(&mut sink, CLOSE_NOT_ACCEPTING, "Server is not accepting new sessions.").await;
        return;
    }

    let (session, kind) = match state.registry.promote(&token).await {
        Ok(Promotion::Fresh(entry)) => {
            match establish(&state, &token, entry, &mut sink, &mut stream).await {
                Some(session) => (session, BootstrapKind::Initial),
                None => return,
            }
        }
        Ok(Promotion::Resume(session)) if !session.is_closed() => {
            info!(token = token_prefix(&token), "Session resumed");
            (session, BootstrapKind::Resend)
        }
        Ok(Promotion::Resume(session)) => {
            state.registry.forget(&session).await;
            reject_invalid_token(&mut sink, &token).await;
            return;
        }
        Err(_) => {
            reject_invalid_token(&mut sink, &token).await;
            return;
        }
    };

    serve(&state, session, kind, sink, stream).await;
}

async fn reject_invalid_token(sink: &mut WsSink, token: &str) {
    info!(
        token = token_prefix(token),
        state = ?HandshakeState::Closed,
        "Rejecting websocket with invalid session token"
    );
    close_with(sink, CLOSE_INVALID_TOKEN, "Invalid session token.").await;
}

/// Build and register a new session from a latent token. Returns `None` when
/// the handshake failed; the reason has been logged and, where possible,
/// sent to the client as a close frame.
async fn establish(
    state: &AppState,
    token: &str,
    entry: LatentEntry,
    sink: &mut WsSink,
    stream: &mut WsStream,
) -> Option<Arc<Session>> {
    debug!(
        token = token_prefix(token),
        state = ?HandshakeState::AwaitingInitialMessage,
        "Waiting for initial message"
    );
    let limit = state.config.server.initial_message_timeout();
    let text = match tokio::time::timeout(limit, next_text(stream)).await {
        Ok(Some(text)) => text,
        Ok(None) => {
            info!(
                token = token_prefix(token),
                "Client left before sending its initial message"
            );
            return None;
        }
        Err(_) => {
            warn!(
                token = token_prefix(token),
                "No initial message within {}s, dropping connection",
                limit.as_secs()
            );
            return None;
        }
    };

    let initial = match parse_initial(&text) {
        Ok(initial) => initial,
        Err(e) => {
            warn!(token = token_prefix(token), "{e}");
            close_with(sink, CLOSE_PROTOCOL_ERROR, "Invalid initial message.").await;
            return None;
        }
    };

    // The page request that issued the token decides where the session starts.
    let target = entry.request.path().to_string();
    let landed = match state.app.navigate(&target).await {
        Ok(landed) => landed,
        Err(e) => {
            error!(token = token_prefix(token), "{e}");
            close_with(sink, CLOSE_INTERNAL_ERROR, &e.to_string()).await;
            return None;
        }
    };

    let session = Session::new(
        token.to_string(),
        entry.request,
        Some(initial),
        Arc::clone(&state.app),
    );
    session.set_active_url(landed).await;

    if let Err(e) = state.registry.activate(Arc::clone(&session)).await {
        error!(token = token_prefix(token), "Failed to register session: {e}");
        close_with(sink, CLOSE_INTERNAL_ERROR, "Session could not be registered.").await;
        return None;
    }
    Some(session)
}

fn parse_initial(text: &str) -> Result<InitialClientMessage, GateError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| GateError::MalformedRequest(format!("Initial message is not JSON: {e}")))?;
    InitialClientMessage::from_json(value)
}

/// Next text frame, skipping control and binary frames. `None` once the
/// client closed or the socket failed.
async fn next_text(stream: &mut WsStream) -> Option<String> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn close_with(sink: &mut WsSink, code: u16, reason: &str) {
    // The client may already be gone.
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: truncate_reason(reason).to_owned().into(),
        })))
        .await;
}

/// Close reasons must fit into a control frame (123 bytes).
fn truncate_reason(reason: &str) -> &str {
    const MAX: usize = 123;
    if reason.len() <= MAX {
        return reason;
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Attach the socket to `session` and pump messages until the connection ends.
async fn serve(
    state: &AppState,
    session: Arc<Session>,
    kind: BootstrapKind,
    mut sink: WsSink,
    mut stream: WsStream,
) {
    let token = session.token().to_string();
    let (tx, mut rx) = mpsc::channel::<Frame>(256);

    // Task: forward session frames to the WebSocket sink
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Frame::Json(value) => match serde_json::to_string(&value) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        error!("WS send: failed to serialize message: {e}");
                        continue;
                    }
                },
                Frame::Close { code, reason } => {
                    close_with(&mut sink, code, &reason).await;
                    break;
                }
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let conn: AttachedConnection = session.attach(tx).await;
    info!(
        token = token_prefix(&token),
        connection = %conn.id,
        state = ?HandshakeState::Active,
        "Session serving"
    );
    session.spawn_bootstrap(kind).await;

    let end = loop {
        tokio::select! {
            () = conn.cancel.cancelled() => break ServeEnd::Cancelled,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.registry.refresh(&token).await;
                    match serde_json::from_str::<Value>(text.as_str()) {
                        Ok(value) => session.dispatch(value).await,
                        Err(e) => warn!(
                            token = token_prefix(&token),
                            "Ignoring non-JSON message: {e}"
                        ),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| f.code);
                    if code == Some(CLOSE_GOING_AWAY) {
                        break ServeEnd::NavigatedAway;
                    }
                    break ServeEnd::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(token = token_prefix(&token), "WS receive error: {e}");
                    break ServeEnd::Disconnected;
                }
                None => break ServeEnd::Disconnected,
            }
        }
    };

    match end {
        ServeEnd::NavigatedAway => {
            info!(
                token = token_prefix(&token),
                state = ?HandshakeState::Closed,
                "Client navigated away"
            );
            match state.registry.close(&token).await {
                Ok(()) => {}
                Err(GateError::InvalidToken) => {
                    // Already removed by someone else; still make sure it is closed.
                    let _ = session.close(false).await;
                }
                Err(e) => warn!(token = token_prefix(&token), "Error closing session: {e}"),
            }
        }
        ServeEnd::Cancelled => {
            if session.is_closed() {
                state.registry.forget(&session).await;
                debug!(
                    token = token_prefix(&token),
                    state = ?HandshakeState::Closed,
                    "Serve loop ended by session close"
                );
            } else {
                debug!(
                    token = token_prefix(&token),
                    connection = %conn.id,
                    "Connection superseded by a newer one"
                );
            }
        }
        ServeEnd::Disconnected => {
            if session.detach(conn.id).await {
                info!(
                    token = token_prefix(&token),
                    state = ?HandshakeState::Disconnected,
                    "Client disconnected, session kept for reconnect"
                );
            }
        }
    }

    let mut send_task = send_task;
    if tokio::time::timeout(SEND_FLUSH_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}
