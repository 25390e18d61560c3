//! Logical session handle that outlives individual websocket connections.
//!
//! A [`Session`] is owned by the registry's active map. It exclusively owns
//! its current outlet (a live connection, a capture buffer for crawlers, or
//! nothing while the client is disconnected), its "serving" signal, the
//! bootstrap task and the queue of inbound messages that arrive before the
//! bootstrap has finished.
//!
//! ## Outlets
//!
//! - **Live**: an mpsc sender feeding the websocket send task. Attaching a
//!   new connection cancels the previous one, so at most one socket serves a
//!   session at any time.
//! - **Capture**: messages are appended to an ordered in-memory list and
//!   later embedded into the crawler's HTML page.
//! - **Detached**: sends are dropped. The session waits for a reconnect.
//!
//! ## Bootstrap ordering
//!
//! The bootstrap (initial full state, or a full-state resend after a
//! reconnect) runs as a spawned task while the serve loop is already reading.
//! Inbound messages that race ahead of it are queued and handed to the
//! application, in order, once the bootstrap has pushed its state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RequestMetadata;
use crate::app::Application;
use crate::error::GateError;
use crate::util::token_prefix;

/// Close code used when the server closes a session on its own.
const CLOSE_NORMAL: u16 = 1000;

/// Frames queued for a connection's send task.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(Value),
    Close { code: u16, reason: String },
}

/// Client capabilities sent as the first frame of a brand-new connection.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitialClientMessage {
    pub website_url: String,
    #[serde(default)]
    pub preferred_languages: Vec<String>,
    #[serde(default)]
    pub user_settings: serde_json::Map<String, Value>,
    pub window_width: f64,
    pub window_height: f64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: String,
    #[serde(default = "default_thousands_separator")]
    pub thousands_separator: String,
    #[serde(default)]
    pub prefers_light_theme: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_decimal_separator() -> String {
    ".".to_string()
}
fn default_thousands_separator() -> String {
    ",".to_string()
}

impl InitialClientMessage {
    pub fn from_json(value: Value) -> Result<Self, GateError> {
        serde_json::from_value(value)
            .map_err(|e| GateError::MalformedRequest(format!("Invalid initial message: {e}")))
    }
}

/// Which state push the bootstrap task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapKind {
    /// First full-state push after the session was created.
    Initial,
    /// Full-state resend after a reconnect; the client's view may be stale.
    Resend,
}

/// Handle returned by [`Session::attach`] to the connection's serve loop.
#[derive(Debug, Clone)]
pub struct AttachedConnection {
    pub id: Uuid,
    /// Cancelled when the session closes or a newer connection takes over.
    pub cancel: CancellationToken,
}

struct LiveConnection {
    id: Uuid,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

enum Outlet {
    Detached,
    Live(LiveConnection),
    Capture(Vec<Value>),
}

#[derive(Default)]
struct InboundQueue {
    /// Whether the current bootstrap has finished and messages may go straight
    /// to the application.
    ready: bool,
    /// Bumped for every bootstrap so a stale task cannot flip `ready`.
    generation: u64,
    pending: VecDeque<Value>,
}

/// A logical application session.
pub struct Session {
    token: String,
    request: RequestMetadata,
    initial: Option<InitialClientMessage>,
    app: Arc<dyn Application>,
    active_url: RwLock<String>,
    outlet: Mutex<Outlet>,
    serving: watch::Sender<bool>,
    cancel: CancellationToken,
    closed: AtomicBool,
    bootstrap: Mutex<Option<JoinHandle<()>>>,
    inbound: Mutex<InboundQueue>,
}

impl Session {
    /// Create a session with no outlet. Attach a connection or enable capture
    /// before sending.
    pub fn new(
        token: String,
        request: RequestMetadata,
        initial: Option<InitialClientMessage>,
        app: Arc<dyn Application>,
    ) -> Arc<Self> {
        let (serving, _) = watch::channel(false);
        let active_url = request.path().to_string();
        Arc::new(Self {
            token,
            request,
            initial,
            app,
            active_url: RwLock::new(active_url),
            outlet: Mutex::new(Outlet::Detached),
            serving,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            bootstrap: Mutex::new(None),
            inbound: Mutex::new(InboundQueue::default()),
        })
    }

    /// Create a socket-less session whose outbound messages are captured.
    pub fn capturing(
        token: String,
        request: RequestMetadata,
        app: Arc<dyn Application>,
    ) -> Arc<Self> {
        let session = Self::new(token, request, None, app);
        // Freshly constructed: nobody else can hold the lock yet.
        if let Ok(mut outlet) = session.outlet.try_lock() {
            *outlet = Outlet::Capture(Vec::new());
        }
        session
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn request(&self) -> &RequestMetadata {
        &self.request
    }

    pub fn initial_message(&self) -> Option<&InitialClientMessage> {
        self.initial.as_ref()
    }

    pub async fn active_url(&self) -> String {
        self.active_url.read().await.clone()
    }

    pub async fn set_active_url(&self, url: String) {
        *self.active_url.write().await = url;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been closed.
    pub async fn wait_closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether a live socket is currently serving this session.
    pub fn is_serving(&self) -> bool {
        *self.serving.borrow()
    }

    /// Watch the serving signal, e.g. to wait for a reconnect.
    pub fn serving(&self) -> watch::Receiver<bool> {
        self.serving.subscribe()
    }

    /// Bind a live connection. Any previously attached connection is
    /// cancelled; its serve loop observes the cancellation and exits.
    pub async fn attach(&self, tx: mpsc::Sender<Frame>) -> AttachedConnection {
        let conn = LiveConnection {
            id: Uuid::new_v4(),
            tx,
            cancel: self.cancel.child_token(),
        };
        let handle = AttachedConnection {
            id: conn.id,
            cancel: conn.cancel.clone(),
        };
        let previous = std::mem::replace(&mut *self.outlet.lock().await, Outlet::Live(conn));
        if let Outlet::Live(old) = previous {
            info!(
                token = token_prefix(&self.token),
                "Replacing connection {}", old.id
            );
            old.cancel.cancel();
        }
        self.serving.send_replace(true);
        handle
    }

    /// Clear the outlet if `connection_id` is still the attached connection.
    /// Returns `false` when a newer connection has already taken over.
    pub async fn detach(&self, connection_id: Uuid) -> bool {
        let mut outlet = self.outlet.lock().await;
        match &*outlet {
            Outlet::Live(conn) if conn.id == connection_id => {
                *outlet = Outlet::Detached;
                drop(outlet);
                self.serving.send_replace(false);
                true
            }
            _ => false,
        }
    }

    /// Best-effort send. Returns whether the message was handed to an outlet;
    /// messages to a detached or already-closed socket are dropped.
    pub async fn send(&self, message: Value) -> bool {
        let tx = {
            let mut outlet = self.outlet.lock().await;
            match &mut *outlet {
                Outlet::Live(conn) => conn.tx.clone(),
                Outlet::Capture(buf) => {
                    buf.push(message);
                    return true;
                }
                Outlet::Detached => {
                    debug!(
                        token = token_prefix(&self.token),
                        "Dropping message for detached session"
                    );
                    return false;
                }
            }
        };
        tx.send(Frame::Json(message)).await.is_ok()
    }

    /// Take the messages captured so far (crawler sessions only).
    pub async fn take_captured(&self) -> Vec<Value> {
        match &mut *self.outlet.lock().await {
            Outlet::Capture(buf) => std::mem::take(buf),
            _ => Vec::new(),
        }
    }

    /// Launch the bootstrap as a task owned by this session. A bootstrap that
    /// is still running from an earlier connection is aborted.
    pub async fn spawn_bootstrap(self: &Arc<Self>, kind: BootstrapKind) {
        let generation = self.reset_inbound().await;
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            session.run_bootstrap(kind, generation).await;
        });
        if let Some(previous) = self.bootstrap.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Run the bootstrap inline, used by socket-less sessions.
    pub async fn bootstrap_now(&self, kind: BootstrapKind) {
        let generation = self.reset_inbound().await;
        self.run_bootstrap(kind, generation).await;
    }

    async fn reset_inbound(&self) -> u64 {
        let mut inbound = self.inbound.lock().await;
        inbound.generation += 1;
        inbound.ready = false;
        inbound.generation
    }

    async fn run_bootstrap(&self, kind: BootstrapKind, generation: u64) {
        debug!(
            token = token_prefix(&self.token),
            ?kind,
            "Bootstrapping session"
        );
        for message in self.app.full_state(self).await {
            self.send(message).await;
        }
        self.drain_inbound(generation).await;
    }

    async fn drain_inbound(&self, generation: u64) {
        loop {
            let next = {
                let mut inbound = self.inbound.lock().await;
                if inbound.generation != generation {
                    return;
                }
                match inbound.pending.pop_front() {
                    Some(message) => message,
                    None => {
                        inbound.ready = true;
                        return;
                    }
                }
            };
            self.handle(next).await;
        }
    }

    /// Deliver an inbound client message, queueing it while a bootstrap is
    /// still in flight.
    pub async fn dispatch(&self, message: Value) {
        {
            let mut inbound = self.inbound.lock().await;
            if !inbound.ready {
                inbound.pending.push_back(message);
                return;
            }
        }
        self.handle(message).await;
    }

    async fn handle(&self, message: Value) {
        if let Err(e) = self.app.on_message(self, message).await {
            warn!(
                token = token_prefix(&self.token),
                "Message handler failed: {e:?}"
            );
        }
    }

    /// Close the session: abort the bootstrap, end the serve loop and run the
    /// application's close hook. Idempotent.
    ///
    /// With `close_remote`, a live client receives a close frame first.
    pub async fn close(&self, close_remote: bool) -> Result<(), GateError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(task) = self.bootstrap.lock().await.take() {
            task.abort();
        }

        let previous = std::mem::replace(&mut *self.outlet.lock().await, Outlet::Detached);
        if let Outlet::Live(conn) = previous {
            if close_remote {
                // Full or closed channel: the socket is going away anyway.
                let _ = conn.tx.try_send(Frame::Close {
                    code: CLOSE_NORMAL,
                    reason: "Session closed".to_string(),
                });
            }
        }
        self.cancel.cancel();
        self.serving.send_replace(false);
        self.inbound.lock().await.pending.clear();

        info!(token = token_prefix(&self.token), "Session closed");

        self.app.on_session_close(self).await.map_err(|e| {
            warn!(
                token = token_prefix(&self.token),
                "Session close hook failed: {e:?}"
            );
            GateError::UpstreamHandlerFailure("on_session_close".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::RecordingApp;
    use serde_json::json;

    fn new_session(app: Arc<RecordingApp>) -> Arc<Session> {
        Session::new(
            "tok-session".to_string(),
            RequestMetadata::for_path("/"),
            None,
            app,
        )
    }

    #[test]
    fn initial_message_parses_camel_case() {
        let msg = InitialClientMessage::from_json(json!({
            "websiteUrl": "http://localhost/",
            "windowWidth": 1280.0,
            "windowHeight": 720.0,
            "preferredLanguages": ["en"],
        }))
        .unwrap();
        assert_eq!(msg.website_url, "http://localhost/");
        assert_eq!(msg.preferred_languages, vec!["en".to_string()]);
        assert_eq!(msg.timezone, "UTC");
    }

    #[test]
    fn initial_message_requires_window_size() {
        let err = InitialClientMessage::from_json(json!({"websiteUrl": "x"})).unwrap_err();
        assert!(matches!(err, GateError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn attach_replaces_and_cancels_previous_connection() {
        let session = new_session(Arc::new(RecordingApp::default()));
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        let first = session.attach(tx1).await;
        assert!(session.is_serving());
        let second = session.attach(tx2).await;

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        // The stale connection cannot detach the new one.
        assert!(!session.detach(first.id).await);
        assert!(session.send(json!({"n": 1})).await);
        assert_eq!(rx2.recv().await, Some(Frame::Json(json!({"n": 1}))));

        assert!(session.detach(second.id).await);
        assert!(!session.is_serving());
        assert!(!session.send(json!({"n": 2})).await);
    }

    #[tokio::test]
    async fn inbound_messages_wait_for_bootstrap() {
        let app = Arc::new(RecordingApp::default());
        let session = new_session(app.clone());
        let (tx, mut rx) = mpsc::channel(8);
        session.attach(tx).await;

        // Nothing bootstrapped yet: messages are queued, not handled.
        session.dispatch(json!({"type": "early"})).await;
        assert!(app.received().await.is_empty());

        session.bootstrap_now(BootstrapKind::Initial).await;
        assert_eq!(
            rx.recv().await,
            Some(Frame::Json(json!({"type": "fullState", "page": "/"})))
        );
        assert_eq!(app.received().await, vec![json!({"type": "early"})]);

        session.dispatch(json!({"type": "late"})).await;
        assert_eq!(app.received().await.len(), 2);
    }

    #[tokio::test]
    async fn spawned_bootstrap_pushes_full_state() {
        let session = new_session(Arc::new(RecordingApp::default()));
        let (tx, mut rx) = mpsc::channel(8);
        session.attach(tx).await;
        session.spawn_bootstrap(BootstrapKind::Resend).await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, Frame::Json(json!({"type": "fullState", "page": "/"})));
    }

    #[tokio::test]
    async fn capture_outlet_records_in_order() {
        let session = Session::capturing(
            "<crawler>".to_string(),
            RequestMetadata::for_path("/docs"),
            Arc::new(RecordingApp::default()),
        );
        assert!(session.send(json!(1)).await);
        assert!(session.send(json!(2)).await);
        assert_eq!(session.take_captured().await, vec![json!(1), json!(2)]);
        assert!(session.take_captured().await.is_empty());
    }

    #[tokio::test]
    async fn close_notifies_client_and_cancels() {
        let app = Arc::new(RecordingApp::default());
        let session = new_session(app.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let conn = session.attach(tx).await;

        session.close(true).await.unwrap();
        assert!(session.is_closed());
        assert!(conn.cancel.is_cancelled());
        assert!(!session.is_serving());
        assert!(matches!(
            rx.recv().await,
            Some(Frame::Close { code: 1000, .. })
        ));
        // Second close is a no-op and does not rerun the hook.
        session.close(true).await.unwrap();
        assert_eq!(app.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn failing_close_hook_is_reported() {
        let app = Arc::new(RecordingApp::failing_close());
        let session = new_session(app);
        let err = session.close(false).await.unwrap_err();
        assert!(matches!(err, GateError::UpstreamHandlerFailure(_)));
        assert!(session.is_closed());
    }
}
