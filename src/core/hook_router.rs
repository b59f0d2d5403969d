//! Hook Router (spec §4.5 / C5).
//!
//! An HTTP endpoint plus in-process dispatcher that normalizes external
//! notify-script payloads into `HookEvent`s and routes them to the right
//! `Session`. Directly grounded on `core::status_server::StatusServer`: the
//! same "find and bind a free port in a range" and "axum router over a
//! small shared `RwLock` state" shapes, generalized from a single
//! `session_id` key to the spec's three-tier `cli_session_id` /
//! `pending_token` / FIFO fallback routing. Delivery is best-effort: an
//! event nothing accepts is logged and dropped, never buffered or retried.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use super::config::HOOK_PORT_RANGE;
use super::session::SessionKind;
use super::TabId;

/// Normalized hook event (spec §3 HookEvent / §6 envelope).
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub event_name: String,
    pub cli_session_id: Option<String>,
    pub pending_token: Option<String>,
    pub is_done: bool,
    pub payload: Value,
}

/// Payload key priority lists used for normalization (spec §4.5).
const EVENT_NAME_KEYS: &[&str] = &["type", "event_type", "hook_event_name", "event", "event_name", "name"];
const SESSION_ID_KEYS: &[&str] = &[
    "thread-id",
    "thread_id",
    "session_id",
    "session-id",
    "conversation_id",
    "conversation-id",
];
const PENDING_TOKEN_KEYS: &[&str] = &["pending_token", "pending-token"];

const DONE_TOKENS: &[&str] = &[
    "agent-turn-complete",
    "turn-complete",
    "response-complete",
    "completed",
    "done",
    "finished",
    "stopped",
];
const DONE_SUFFIXES: &[&str] = &["-complete", "-completed", "-done", "-finished", "/complete", "/completed", "/done", "/finished"];
const DONE_STATUSES: &[&str] = &["complete", "completed", "done", "finished", "stopped", "success", "ok"];

/// Event names that trigger the debounced file-tree refresh advisory signal,
/// independent of whether they route to any session (spec §4.5).
const REFRESH_TRIGGERS: &[&str] = &["PostToolUse", "SessionEnd", "Stop", "SubagentStop"];

fn first_nonempty_string(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        payload
            .get(*k)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Is `token` a completion marker per spec §4.5's done-set / suffix rules?
fn is_done_token(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    DONE_TOKENS.contains(&lower.as_str()) || DONE_SUFFIXES.iter().any(|suf| lower.ends_with(suf))
}

fn status_says_done(payload: &Value) -> bool {
    let check = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .map(|s| DONE_STATUSES.contains(&s.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    };
    check(payload.get("status")) || check(payload.get("payload").and_then(|p| p.get("status")))
}

/// Normalizes an arbitrary JSON payload into a `HookEvent` (spec §4.5).
/// `fallback_name` is the caller-supplied argv token used when no payload
/// key yields an event name (e.g. for in-process events that bypass HTTP).
pub fn normalize(payload: Value, fallback_name: &str) -> HookEvent {
    let event_name = first_nonempty_string(&payload, EVENT_NAME_KEYS)
        .unwrap_or_else(|| fallback_name.to_string());

    let is_done = is_done_token(&event_name) || status_says_done(&payload);

    HookEvent {
        cli_session_id: first_nonempty_string(&payload, SESSION_ID_KEYS),
        pending_token: first_nonempty_string(&payload, PENDING_TOKEN_KEYS),
        is_done,
        event_name,
        payload,
    }
}

/// Whether a normalized event should also trigger the coalesced refresh
/// signal (spec §4.5/§6). Purely advisory — callers must not let this alter
/// Session state.
pub fn triggers_refresh(event: &HookEvent) -> bool {
    event.is_done || REFRESH_TRIGGERS.iter().any(|t| t.eq_ignore_ascii_case(&event.event_name))
}

/// Trait implemented by `Session` so the router can dispatch without a
/// concrete dependency on it (mirrors `status_server::EmitFn`'s use of a
/// type-erased callback instead of a concrete `AppHandle` field).
pub trait HookSink: Send + Sync {
    fn tab_id(&self) -> &TabId;
    fn kind(&self) -> SessionKind;
    /// `None` before the handshake binds a `cli_session_id`.
    fn bound_session_id(&self) -> Option<String>;
    fn handle_hook(&self, event: &HookEvent);
}

struct RouterState {
    /// `cli_session_id -> sinks`. A session id can (in principle) be shared
    /// by more than one sink only transiently; in practice it's one.
    by_session_id: HashMap<String, Vec<Weak<dyn HookSink>>>,
    /// `pending_token -> sink`, covering the startup window before a
    /// `cli_session_id` is known.
    by_pending_token: HashMap<String, Weak<dyn HookSink>>,
    /// FIFO queues of sinks in handshake, keyed by kind, for the
    /// degenerate "neither id nor token present" routing case.
    awaiting_handshake: HashMap<SessionKind, VecDeque<Weak<dyn HookSink>>>,
}

impl RouterState {
    fn new() -> Self {
        Self {
            by_session_id: HashMap::new(),
            by_pending_token: HashMap::new(),
            awaiting_handshake: HashMap::new(),
        }
    }
}

const RAW_EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-process dispatcher plus (once started) the HTTP listener that feeds
/// it. Cheap to `Clone` (`Arc` wrapper) so the axum handler and the Session
/// Manager can share it.
#[derive(Clone)]
pub struct HookRouter {
    state: Arc<RwLock<RouterState>>,
    /// Every normalized event, regardless of routing outcome — the Session
    /// Manager subscribes to this to drive the debounced `refresh` signal,
    /// which per spec §4.5 "MUST NOT alter Session state" and so must not
    /// be implemented inside per-session dispatch.
    raw_events: broadcast::Sender<HookEvent>,
}

impl Default for HookRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRouter {
    pub fn new() -> Self {
        let (raw_events, _) = broadcast::channel(RAW_EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(RouterState::new())),
            raw_events,
        }
    }

    /// Subscribes to every normalized event, independent of routing.
    pub fn subscribe_raw_events(&self) -> broadcast::Receiver<HookEvent> {
        self.raw_events.subscribe()
    }

    /// Registers a sink under its pending token and as the newest entry in
    /// its kind's handshake FIFO. Called when a Session enters
    /// `AwaitingHandshake`.
    pub async fn register_pending(&self, token: &str, sink: Weak<dyn HookSink>) {
        let mut state = self.state.write().await;
        state.by_pending_token.insert(token.to_string(), sink.clone());
        state
            .awaiting_handshake
            .entry(sink.upgrade().map(|s| s.kind()).unwrap_or(SessionKind::Builder))
            .or_default()
            .push_back(sink);
    }

    /// Registers a sink under its bound `cli_session_id` (steady state).
    pub async fn register_session_id(&self, cli_session_id: &str, sink: Weak<dyn HookSink>) {
        let mut state = self.state.write().await;
        state
            .by_session_id
            .entry(cli_session_id.to_string())
            .or_default()
            .push(sink);
    }

    /// Drops every registration for a sink: its pending token, its bound
    /// session id if any, and its entry in any handshake FIFO. Spec §8
    /// property 7: after close, the tab must be absent from every routing
    /// table.
    pub async fn unregister(&self, tab_id: &TabId, pending_token: Option<&str>, cli_session_id: Option<&str>) {
        let mut state = self.state.write().await;
        if let Some(token) = pending_token {
            state.by_pending_token.remove(token);
        }
        if let Some(id) = cli_session_id {
            if let Some(sinks) = state.by_session_id.get_mut(id) {
                sinks.retain(|s| s.upgrade().map(|s| s.tab_id() != tab_id).unwrap_or(false));
                if sinks.is_empty() {
                    state.by_session_id.remove(id);
                }
            }
        }
        for queue in state.awaiting_handshake.values_mut() {
            queue.retain(|s| s.upgrade().map(|s| s.tab_id() != tab_id).unwrap_or(false));
        }
    }

    /// Routes one normalized event per spec §4.5's four-step precedence.
    pub async fn dispatch(&self, event: HookEvent) {
        let _ = self.raw_events.send(event.clone());

        let mut state = self.state.write().await;

        // 1. Known cli_session_id -> every matching sink.
        if let Some(id) = event.cli_session_id.clone() {
            if let Some(sinks) = state.by_session_id.get(&id) {
                let live: Vec<_> = sinks.iter().filter_map(Weak::upgrade).collect();
                if !live.is_empty() {
                    drop(state);
                    Self::safe_dispatch(&live, &event);
                    return;
                }
            }
        }

        // 2. Registered pending token.
        if let Some(token) = event.pending_token.clone() {
            if let Some(sink) = state.by_pending_token.get(&token).and_then(Weak::upgrade) {
                drop(state);
                Self::safe_dispatch(&[sink], &event);
                return;
            }
        }

        // 3. FIFO fallback to the oldest sink awaiting handshake, of the
        // matching kind. Only a Reviewer's launch sends a synthetic "ping"
        // that can produce a completion event before its cli_session_id is
        // known (spec §4.5: "e.g. first reviewer completion"); a Builder's
        // own hooks always carry a real id once they fire, so a Builder
        // mid-handshake is never a legitimate target here. Restricting to
        // one kind keeps an ambiguous event from ever reaching the wrong
        // kind's sink.
        if let Some(queue) = state.awaiting_handshake.get_mut(&SessionKind::Reviewer) {
            while let Some(weak) = queue.front().cloned() {
                match weak.upgrade() {
                    Some(sink) => {
                        queue.pop_front();
                        drop(state);
                        Self::safe_dispatch(&[sink], &event);
                        return;
                    }
                    None => {
                        queue.pop_front();
                    }
                }
            }
        }

        // 4. Kind-wide broadcast fallback; log and drop.
        log::warn!(
            "hook event '{}' matched no session (cli_session_id={:?}, pending_token={:?}); broadcasting",
            event.event_name,
            event.cli_session_id,
            event.pending_token
        );
        let all_sinks: Vec<_> = state
            .by_session_id
            .values()
            .flatten()
            .chain(state.by_pending_token.values())
            .chain(state.awaiting_handshake.values().flatten())
            .filter_map(Weak::upgrade)
            .collect();
        drop(state);

        Self::safe_dispatch(&all_sinks, &event);
    }

    /// Invokes `handle_hook` on every sink, isolating panics/early-returns
    /// so one handler's failure never prevents the others from running
    /// (spec §4.5: "Delivery to multiple handlers is isolated").
    fn safe_dispatch(sinks: &[Arc<dyn HookSink>], event: &HookEvent) {
        for sink in sinks {
            let sink = sink.clone();
            let event = event.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                sink.handle_hook(&event);
            }));
            if result.is_err() {
                log::error!("hook handler for tab {:?} panicked; continuing dispatch", sink.tab_id());
            }
        }
    }

    /// Binds to the first free port in `HOOK_PORT_RANGE`, returning the
    /// bound listener (avoids the bind-after-check race the teacher's
    /// `find_and_bind_port` comment calls out).
    async fn find_and_bind_port() -> Option<(u16, tokio::net::TcpListener)> {
        for port in HOOK_PORT_RANGE.0..=HOOK_PORT_RANGE.1 {
            let addr = format!("127.0.0.1:{port}");
            if let Ok(listener) = tokio::net::TcpListener::bind(&addr).await {
                return Some((port, listener));
            }
        }
        None
    }

    /// Every `cli_session_id` currently bound to at least one live sink.
    /// Diagnostic only; not wired to any UI surface.
    pub async fn registered_sessions(&self) -> Vec<String> {
        let state = self.state.read().await;
        state
            .by_session_id
            .iter()
            .filter(|(_, sinks)| sinks.iter().any(|s| s.upgrade().is_some()))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every pending token currently awaiting a handshake bind. Diagnostic
    /// only; not wired to any UI surface.
    pub async fn pending_tokens(&self) -> Vec<String> {
        let state = self.state.read().await;
        state
            .by_pending_token
            .iter()
            .filter(|(_, sink)| sink.upgrade().is_some())
            .map(|(token, _)| token.clone())
            .collect()
    }

    /// Starts the `POST /hook-notify` HTTP listener. Returns the bound
    /// port, or `None` if the whole range was unavailable.
    pub async fn start(&self) -> Option<u16> {
        let (port, listener) = Self::find_and_bind_port().await?;
        let router = Router::new()
            .route("/hook-notify", post(handle_notify))
            .with_state(self.clone());

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                log::error!("hook router HTTP server error: {e}");
            }
        });

        log::info!("hook router listening on http://127.0.0.1:{port}/hook-notify");
        Some(port)
    }
}

/// `POST /hook-notify` handler. Always returns `200 OK` once the body is
/// accepted (spec §6: "external notify scripts are fire-and-forget and must
/// never block the CLI"); malformed bodies are logged and dropped.
async fn handle_notify(State(router): State<HookRouter>, body: axum::body::Bytes) -> StatusCode {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("hook-notify: invalid JSON body ({e}); dropping");
            return StatusCode::OK;
        }
    };

    let event = normalize(payload, "unknown");
    router.dispatch(event).await;
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct TestSink {
        tab_id: TabId,
        kind: SessionKind,
        bound: Mutex<Option<String>>,
        received: Mutex<Vec<HookEvent>>,
    }

    impl HookSink for TestSink {
        fn tab_id(&self) -> &TabId {
            &self.tab_id
        }
        fn kind(&self) -> SessionKind {
            self.kind
        }
        fn bound_session_id(&self) -> Option<String> {
            self.bound.lock().unwrap().clone()
        }
        fn handle_hook(&self, event: &HookEvent) {
            self.received.lock().unwrap().push(event.clone());
        }
    }

    fn sink(id: &str, kind: SessionKind) -> Arc<TestSink> {
        Arc::new(TestSink {
            tab_id: TabId(id.to_string()),
            kind,
            bound: Mutex::new(None),
            received: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn normalizes_event_name_from_priority_keys() {
        let payload = serde_json::json!({"hook_event_name": "agent-turn-complete"});
        let event = normalize(payload, "fallback");
        assert_eq!(event.event_name, "agent-turn-complete");
        assert!(event.is_done);
    }

    #[test]
    fn falls_back_to_argv_token_when_no_key_present() {
        let payload = serde_json::json!({"unrelated": "value"});
        let event = normalize(payload, "my-fallback");
        assert_eq!(event.event_name, "my-fallback");
    }

    #[test]
    fn suffix_and_status_based_completion_detection() {
        assert!(is_done_token("tool-call-complete"));
        assert!(is_done_token("Stop"));
        let payload = serde_json::json!({"status": "success"});
        assert!(status_says_done(&payload));
        let payload = serde_json::json!({"payload": {"status": "ok"}});
        assert!(status_says_done(&payload));
    }

    #[tokio::test]
    async fn routes_by_cli_session_id_when_known() {
        let router = HookRouter::new();
        let s = sink("t1", SessionKind::Reviewer);
        router.register_session_id("cs-42", Arc::downgrade(&s) as Weak<dyn HookSink>).await;

        let event = normalize(serde_json::json!({"event": "x", "thread-id": "cs-42"}), "x");
        router.dispatch(event).await;

        assert_eq!(s.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn routes_by_pending_token_when_id_unknown() {
        let router = HookRouter::new();
        let s = sink("t1", SessionKind::Reviewer);
        router.register_pending("pt-1", Arc::downgrade(&s) as Weak<dyn HookSink>).await;

        let event = normalize(serde_json::json!({"event": "x", "pending_token": "pt-1"}), "x");
        router.dispatch(event).await;

        assert_eq!(s.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fifo_fallback_delivers_to_oldest_awaiting_handshake() {
        let router = HookRouter::new();
        let older = sink("older", SessionKind::Reviewer);
        let newer = sink("newer", SessionKind::Reviewer);
        router.register_pending("pt-older", Arc::downgrade(&older) as Weak<dyn HookSink>).await;
        router.register_pending("pt-newer", Arc::downgrade(&newer) as Weak<dyn HookSink>).await;

        // Neither cli_session_id nor pending_token present on this event.
        let event = normalize(serde_json::json!({"event": "codex-notify"}), "x");
        router.dispatch(event).await;

        assert_eq!(older.received.lock().unwrap().len(), 1);
        assert_eq!(newer.received.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn fifo_fallback_never_crosses_into_a_different_kind() {
        let router = HookRouter::new();
        let builder = sink("builder-mid-handshake", SessionKind::Builder);
        let reviewer = sink("reviewer-mid-handshake", SessionKind::Reviewer);
        // Builder registered first, so a kind-blind FIFO would pick it.
        router.register_pending("pt-builder", Arc::downgrade(&builder) as Weak<dyn HookSink>).await;
        router.register_pending("pt-reviewer", Arc::downgrade(&reviewer) as Weak<dyn HookSink>).await;

        let event = normalize(serde_json::json!({"event": "codex-notify"}), "x");
        router.dispatch(event).await;

        assert_eq!(builder.received.lock().unwrap().len(), 0);
        assert_eq!(reviewer.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_fallback_reaches_all_live_sinks() {
        let router = HookRouter::new();
        let a = sink("a", SessionKind::Builder);
        let b = sink("b", SessionKind::Builder);
        router.register_session_id("cs-a", Arc::downgrade(&a) as Weak<dyn HookSink>).await;
        router.register_session_id("cs-b", Arc::downgrade(&b) as Weak<dyn HookSink>).await;

        // No id/token at all and nothing mid-handshake -> broadcast.
        let event = normalize(serde_json::json!({"event": "Stop"}), "x");
        router.dispatch(event).await;

        assert_eq!(a.received.lock().unwrap().len(), 1);
        assert_eq!(b.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregister_removes_all_routes() {
        let router = HookRouter::new();
        let s = sink("t1", SessionKind::Builder);
        router.register_session_id("cs-1", Arc::downgrade(&s) as Weak<dyn HookSink>).await;
        router.register_pending("pt-1", Arc::downgrade(&s) as Weak<dyn HookSink>).await;

        router.unregister(&TabId("t1".to_string()), Some("pt-1"), Some("cs-1")).await;

        let event = normalize(serde_json::json!({"event": "x", "thread-id": "cs-1"}), "x");
        router.dispatch(event).await;
        // No sinks left at all (by-session-id route gone); broadcast also
        // reaches nothing, so nothing is received.
        assert_eq!(s.received.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn diagnostic_accessors_reflect_live_registrations() {
        let router = HookRouter::new();
        let s = sink("t1", SessionKind::Builder);
        router.register_session_id("cs-1", Arc::downgrade(&s) as Weak<dyn HookSink>).await;
        router.register_pending("pt-1", Arc::downgrade(&s) as Weak<dyn HookSink>).await;

        assert_eq!(router.registered_sessions().await, vec!["cs-1".to_string()]);
        assert_eq!(router.pending_tokens().await, vec!["pt-1".to_string()]);

        router.unregister(&TabId("t1".to_string()), Some("pt-1"), Some("cs-1")).await;
        assert!(router.registered_sessions().await.is_empty());
        assert!(router.pending_tokens().await.is_empty());
    }

    #[test]
    fn refresh_trigger_detection_is_advisory_only() {
        let e1 = normalize(serde_json::json!({"event": "PostToolUse"}), "x");
        assert!(triggers_refresh(&e1));
        let e2 = normalize(serde_json::json!({"event": "unrelated-event"}), "x");
        assert!(!triggers_refresh(&e2));
    }

    #[tokio::test]
    async fn live_http_endpoint_normalizes_and_dispatches_posted_events() {
        let router = HookRouter::new();
        let mut raw = router.subscribe_raw_events();
        let port = router.start().await.expect("port range exhausted in test env");

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://127.0.0.1:{port}/hook-notify"))
            .json(&serde_json::json!({"hook_event_name": "agent-turn-complete", "thread-id": "cs-live"}))
            .send()
            .await
            .expect("request to local hook-notify endpoint failed");

        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), raw.recv())
            .await
            .expect("raw event not received before timeout")
            .expect("raw events channel closed");
        assert_eq!(event.cli_session_id.as_deref(), Some("cs-live"));
        assert!(event.is_done);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn duplicate_completion_hook_is_a_no_op_on_a_real_session() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        use crate::core::session::{BuilderMode, Session, SessionKind, SessionMode, SessionParams, SessionState};
        use crate::core::TabId;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("init.sh"), b"export PATH=\"$PWD:$PATH\"\n").unwrap();
        let builder_script = dir.path().join("builder");
        std::fs::write(&builder_script, b"#!/bin/sh\necho BUILDER-READY\nexec cat\n").unwrap();
        std::fs::set_permissions(&builder_script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let params = SessionParams {
            tab_id: TabId("idempotence-test".to_string()),
            kind: SessionKind::Builder,
            mode: SessionMode::Builder(BuilderMode::New),
            change_id: None,
            resume_id: None,
            project_dir: dir.path().to_str().unwrap().to_string(),
            shell_path: "/bin/sh".to_string(),
            init_script: Some("init.sh".to_string()),
            agent_ready_markers: vec!["BUILDER-READY".to_string()],
        };

        let router = Arc::new(HookRouter::new());
        let session = Session::open(params, router).await.expect("session failed to open");

        wait_for_state(&session, SessionState::AwaitingHandshake, Duration::from_secs(10)).await;

        session.handle_hook(&HookEvent {
            event_name: "session-start".to_string(),
            cli_session_id: Some("cs-idempotence".to_string()),
            pending_token: None,
            is_done: false,
            payload: serde_json::json!({}),
        });
        wait_for_state(&session, SessionState::Ready, Duration::from_secs(5)).await;

        session.submit("do the thing").expect("submit from Ready must succeed");
        assert!(session.busy());
        let history_before = session.history().len();

        let done = HookEvent {
            event_name: "agent-turn-complete".to_string(),
            cli_session_id: Some("cs-idempotence".to_string()),
            pending_token: None,
            is_done: true,
            payload: serde_json::json!({"message": "done"}),
        };

        session.handle_hook(&done);
        assert!(!session.busy());
        let history_after_first = session.history().len();
        assert_eq!(history_after_first, history_before + 1);

        // Re-delivered (e.g. via the broadcast fallback); task_id is already
        // cleared so this must not append a second completion.
        session.handle_hook(&done);
        assert!(!session.busy());
        assert_eq!(session.history().len(), history_after_first);

        session.close().await;
    }

    #[cfg(unix)]
    async fn wait_for_state(session: &crate::core::session::Session, target: crate::core::session::SessionState, timeout: std::time::Duration) {
        tokio::time::timeout(timeout, async {
            loop {
                if session.state() == target {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session did not reach {target:?} before timeout"));
    }
}
