//! Session state machine (spec §4.4 / C4).
//!
//! A `Session` composes a `PtyChannel`, a `Sequencer` driving its launch
//! handshake, and a small state machine tracking lifecycle/busy status.
//! Grounded on the teacher's `SessionConfig`/`SessionManager` pair for the
//! data shape (id, history, timestamps), generalized with the handshake and
//! hook-binding machinery the teacher never needed because it only ever
//! launched an interactive login shell, never waited for an external
//! process to announce its own readiness.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use super::config::{
    BUILDER_HANDSHAKE_TIMEOUT, DEFAULT_STEP_TIMEOUT, HISTORY_CAP, REVIEWER_HANDSHAKE_TIMEOUT,
};
use super::error::SessionError;
use super::hook_router::{HookEvent, HookRouter, HookSink};
use super::prompt_matcher::{default_shell_glyphs, PromptPredicate};
use super::pty::{PtyChannel, PtySpawnOptions};
use super::sequencer::{write_with_paste_mode, Sequencer, Step, StepOutcome};

/// Opaque identifier for a tab/session, distinct from the process- or
/// CLI-assigned `cli_session_id`. A newtype over `String` rather than the
/// teacher's bare `u32` session ids: tabs are created and torn down from the
/// frontend, which already mints string ids for its own UI state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(pub String);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    Builder,
    Reviewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuilderMode {
    New,
    Continue,
    Fix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewerMode {
    Standalone,
    Review,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionMode {
    Builder(BuilderMode),
    Reviewer(ReviewerMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Launching,
    AwaitingShell,
    AwaitingInit,
    AwaitingHandshake,
    Ready,
    Working,
    Stopped,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

/// Observable lifecycle events, mirrored out to whatever owns the Session
/// (the Session Manager, and through it the Tauri event bridge).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ready,
    TurnComplete { text: String },
    Stopped { reason: String },
    Exit { code: i32 },
    BusyChanged { busy: bool },
    Bound { cli_session_id: String },
    HistoryAppended(HistoryEntry),
}

/// Parameters needed to open a new session. Provided by the Session Manager,
/// which knows the project directory and any per-kind agent-ready markers.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub tab_id: TabId,
    pub kind: SessionKind,
    pub mode: SessionMode,
    pub change_id: Option<String>,
    pub resume_id: Option<String>,
    pub project_dir: String,
    pub shell_path: String,
    pub init_script: Option<String>,
    pub agent_ready_markers: Vec<String>,
}

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct BusyState {
    task_id: Option<String>,
}

/// One Builder or Reviewer session.
pub struct Session {
    tab_id: TabId,
    kind: SessionKind,
    mode: SessionMode,
    change_id: Option<String>,
    resume_id: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: StdMutex<DateTime<Utc>>,

    channel: PtyChannel,
    sequencer: Sequencer,

    state: StdMutex<SessionState>,
    cli_session_id: StdMutex<Option<String>>,
    pending_token: StdMutex<Option<String>>,
    /// `busy()` is derived from `task_id.is_some()` rather than tracked as a
    /// separate flag, so the invariant `busy ⇔ task_id ≠ null` holds by
    /// construction instead of depending on clearing the two fields in the
    /// right order.
    busy: StdMutex<BusyState>,
    history: StdMutex<VecDeque<HistoryEntry>>,
    /// Completed (taking the sender) the first time `handle_hook` sees a
    /// `cli_session_id` while `AwaitingHandshake`. `None` before the
    /// handshake reaches that point and after it resolves.
    bind_waiter: StdMutex<Option<oneshot::Sender<String>>>,

    agent_ready_markers: Vec<String>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Spawns the session's shell, registers it with `router` under a fresh
    /// pending token, and drives the launch handshake to completion in the
    /// background. Returns immediately once the PTY is up; callers observe
    /// `Ready`/`Stopped` via `subscribe_events`.
    pub async fn open(params: SessionParams, router: Arc<HookRouter>) -> Result<Arc<Self>, SessionError> {
        let pending_token = uuid::Uuid::new_v4().to_string();

        let mut env = std::collections::HashMap::new();
        env.insert("PENDING_TOKEN".to_string(), pending_token.clone());

        let channel = PtyChannel::start(PtySpawnOptions {
            cmd: params.shell_path.clone(),
            args: vec![],
            env,
            cwd: Some(params.project_dir.clone()),
            cols: 80,
            rows: 24,
        })?;

        let now = Utc::now();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let session = Arc::new(Self {
            tab_id: params.tab_id.clone(),
            kind: params.kind,
            mode: params.mode.clone(),
            change_id: params.change_id.clone(),
            resume_id: params.resume_id.clone(),
            created_at: now,
            last_activity_at: StdMutex::new(now),
            sequencer: Sequencer::new(channel.clone()),
            channel,
            state: StdMutex::new(SessionState::Launching),
            cli_session_id: StdMutex::new(None),
            pending_token: StdMutex::new(Some(pending_token.clone())),
            busy: StdMutex::new(BusyState { task_id: None }),
            history: StdMutex::new(VecDeque::new()),
            bind_waiter: StdMutex::new(None),
            agent_ready_markers: params.agent_ready_markers.clone(),
            events: events_tx,
        });

        router.register_pending(&pending_token, Arc::downgrade(&session) as Weak<dyn HookSink>).await;

        session.spawn_exit_watcher();

        let handshake_session = session.clone();
        let handshake_params = params;
        tokio::spawn(async move {
            handshake_session.run_handshake(handshake_params).await;
        });

        Ok(session)
    }

    /// Watches the PTY channel's exit signal for the lifetime of the
    /// session. A deliberate stop (`close`/`fail_handshake`) already moves
    /// the state to `Closed`/`Stopped` before killing the channel, so this
    /// only has work to do when the underlying CLI exits on its own (spec
    /// §4.4: "CLI exits unexpectedly -> mark Stopped; surface exit code").
    fn spawn_exit_watcher(self: &Arc<Self>) {
        let session = self.clone();
        let mut exit_rx = self.channel.subscribe_exit();
        tokio::spawn(async move {
            if exit_rx.changed().await.is_err() {
                return;
            }
            let code = exit_rx.borrow().unwrap_or(-1);
            session.on_unexpected_exit(code);
        });
    }

    fn on_unexpected_exit(&self, code: i32) {
        let state = self.state();
        if matches!(state, SessionState::Closed | SessionState::Stopped) {
            return;
        }

        self.busy.lock().unwrap().task_id = None;
        self.set_state(SessionState::Stopped);
        self.touch();
        self.append_history(Role::System, format!("{} exited unexpectedly (code {code}).", kind_label(self.kind)));
        self.emit(SessionEvent::BusyChanged { busy: false });
        self.emit(SessionEvent::Exit { code });
        self.emit(SessionEvent::Stopped { reason: format!("process exited with code {code}") });
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    pub fn change_id(&self) -> Option<&str> {
        self.change_id.as_deref()
    }

    pub fn resume_id(&self) -> Option<&str> {
        self.resume_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        *self.last_activity_at.lock().unwrap()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn busy(&self) -> bool {
        self.busy.lock().unwrap().task_id.is_some()
    }

    pub fn cli_session_id(&self) -> Option<String> {
        self.cli_session_id.lock().unwrap().clone()
    }

    pub fn pending_token(&self) -> Option<String> {
        self.pending_token.lock().unwrap().clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Exposes the underlying channel so a Tauri event bridge can forward
    /// raw output/exit without `Session` itself depending on `tauri`.
    pub fn channel(&self) -> &PtyChannel {
        &self.channel
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    fn touch(&self) {
        *self.last_activity_at.lock().unwrap() = Utc::now();
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn append_history(&self, role: Role, text: impl Into<String>) {
        let entry = HistoryEntry { role, text: text.into() };
        let mut history = self.history.lock().unwrap();
        history.push_back(entry.clone());
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
        drop(history);
        self.emit(SessionEvent::HistoryAppended(entry));
    }

    /// Runs the cd / init-script / CLI-launch sequence, then waits for the
    /// handshake hook to bind a `cli_session_id` (spec §6 launch contract).
    async fn run_handshake(self: Arc<Self>, params: SessionParams) {
        // The freshly spawned shell prints its own boot prompt before we
        // should type anything; wait for it with an empty "step".
        let boot = self
            .sequencer
            .run_step(Step::new(
                Vec::new(),
                PromptPredicate::ShellReady { glyphs: default_shell_glyphs() },
                DEFAULT_STEP_TIMEOUT,
            ))
            .await;
        if !matches!(boot, StepOutcome::Fired) {
            self.fail_handshake("shell did not produce an initial prompt").await;
            return;
        }
        self.set_state(SessionState::AwaitingShell);

        let cd_step = Step::new(
            format!("cd {}", shell_quote(&params.project_dir)),
            PromptPredicate::ShellReady { glyphs: default_shell_glyphs() },
            DEFAULT_STEP_TIMEOUT,
        );
        if !matches!(self.sequencer.run_step(cd_step).await, StepOutcome::Fired) {
            self.fail_handshake("cd into project directory timed out").await;
            return;
        }
        self.set_state(SessionState::AwaitingInit);

        if let Some(script) = params.init_script.as_ref() {
            if resolve_init_script(&params.project_dir, script).is_some() {
                let init_step = Step::new(
                    format!("source {}", shell_quote(script)),
                    PromptPredicate::ShellReady { glyphs: default_shell_glyphs() },
                    DEFAULT_STEP_TIMEOUT,
                );
                if !matches!(self.sequencer.run_step(init_step).await, StepOutcome::Fired) {
                    self.fail_handshake("project init script timed out").await;
                    return;
                }
            } else {
                log::warn!("init script {script} not found in {}; skipping", params.project_dir);
            }
        }

        let launch_line = launch_command(self.kind, params.resume_id.as_deref());
        let handshake_timeout = match self.kind {
            SessionKind::Builder => BUILDER_HANDSHAKE_TIMEOUT,
            SessionKind::Reviewer => REVIEWER_HANDSHAKE_TIMEOUT,
        };
        let launch_step = Step::new(
            launch_line,
            PromptPredicate::AgentReady { markers: self.agent_ready_markers.clone() },
            handshake_timeout,
        );
        if !matches!(self.sequencer.run_step(launch_step).await, StepOutcome::Fired) {
            self.fail_handshake("cli did not reach its ready prompt").await;
            return;
        }
        self.set_state(SessionState::AwaitingHandshake);

        // From here binding happens out-of-band: `handle_hook` (invoked by
        // the Hook Router against this session's pending token) completes
        // `bind_rx` the first time an event carries a `cli_session_id`.
        let (bind_tx, bind_rx) = oneshot::channel();
        *self.bind_waiter.lock().unwrap() = Some(bind_tx);

        match tokio::time::timeout(handshake_timeout, bind_rx).await {
            Ok(Ok(cli_session_id)) => {
                *self.cli_session_id.lock().unwrap() = Some(cli_session_id.clone());
                *self.pending_token.lock().unwrap() = None;
                self.set_state(SessionState::Ready);
                self.touch();
                self.append_history(Role::System, format!("{} is ready.", kind_label(self.kind)));
                self.emit(SessionEvent::Bound { cli_session_id });
                self.emit(SessionEvent::Ready);
            }
            _ => {
                self.fail_handshake("handshake hook never arrived").await;
            }
        }
    }

    async fn fail_handshake(&self, reason: &str) {
        log::warn!("session {} handshake failed: {reason}", self.tab_id);
        self.set_state(SessionState::Stopped);
        self.append_history(Role::System, format!("failed to start: {reason}"));
        self.emit(SessionEvent::Stopped { reason: reason.to_string() });
        let _ = self.channel.kill().await;
    }

    /// Sends one turn of user input. Valid only from `Ready`; mints a fresh
    /// `task_id`, transitions to `Working`, and returns immediately — the
    /// matching completion arrives later via a hook, not via prompt
    /// matching (spec §5: "drive completion off the hook, not the output").
    pub fn submit(&self, text: &str) -> Result<(), SessionError> {
        {
            let state = self.state.lock().unwrap();
            if *state != SessionState::Ready {
                return Err(SessionError::NotReady(self.tab_id.to_string()));
            }
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        self.busy.lock().unwrap().task_id = Some(task_id);
        self.set_state(SessionState::Working);
        self.touch();
        self.append_history(Role::User, text.to_string());
        self.emit(SessionEvent::BusyChanged { busy: true });

        write_with_paste_mode(&self.channel, text.as_bytes());
        Ok(())
    }

    /// Injects text without changing state (spec §6 `sendMessageExternally`)
    /// — used for AutoFix to hand a reviewer's findings to a builder, or
    /// vice versa, without going through the normal `submit` busy-gating.
    pub fn send_message_externally(&self, text: &str) {
        self.touch();
        write_with_paste_mode(&self.channel, text.as_bytes());
    }

    /// Interrupts the in-flight turn: sends an interrupt byte (Ctrl-C) and
    /// returns the session to `Ready` without emitting `turn_complete`
    /// (spec §4.4 state table: `Working --stop--> Ready`). `task_id` is
    /// cleared first so a completion hook for the aborted turn that arrives
    /// late is discarded as a duplicate rather than acted on.
    pub fn stop(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Working {
            return Err(SessionError::NotReady(self.tab_id.to_string()));
        }
        self.busy.lock().unwrap().task_id = None;
        self.channel.write(&[0x03]);
        self.set_state(SessionState::Ready);
        self.touch();
        self.emit(SessionEvent::BusyChanged { busy: false });
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.channel.resize(cols, rows).map_err(SessionError::from)
    }

    /// Appends a system-role history entry without touching PTY or state —
    /// used by the Session Manager to record why an AutoFix loop stopped.
    pub fn append_system_note(&self, text: impl Into<String>) {
        self.append_history(Role::System, text.into());
    }

    /// Kills the underlying PTY and transitions to `Closed`. Idempotent.
    pub async fn close(&self) {
        self.sequencer.abort();
        self.set_state(SessionState::Closed);
        let _ = self.channel.kill().await;
    }
}

impl HookSink for Session {
    fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    fn kind(&self) -> SessionKind {
        self.kind
    }

    fn bound_session_id(&self) -> Option<String> {
        self.cli_session_id()
    }

    /// Central hook-arrival handler (spec §4.4/§8's S1-S6 scenarios).
    ///
    /// - Not yet bound, in `AwaitingHandshake`: the first event carrying a
    ///   `cli_session_id` *is* the bind signal, whether it's a Builder's
    ///   session-start notification or a Reviewer's completion of its
    ///   synthetic "ping".
    /// - Bound and `Working`: an `is_done` event completes the current turn,
    ///   guarded by `task_id` so a stray duplicate (same hook re-delivered,
    ///   or a broadcast-fallback event after the turn already completed)
    ///   is a no-op rather than a second `TurnComplete`.
    /// - Bound and not `Working` (already `Ready`, or anything else): any
    ///   leftover/duplicate event is discarded.
    fn handle_hook(&self, event: &HookEvent) {
        let state = self.state();

        if state == SessionState::AwaitingHandshake && self.cli_session_id().is_none() {
            if let Some(id) = event.cli_session_id.clone() {
                if let Some(tx) = self.bind_waiter.lock().unwrap().take() {
                    let _ = tx.send(id);
                }
            }
            return;
        }

        if event.cli_session_id.is_none() && self.cli_session_id().is_some() {
            // Broadcast-fallback event with no id attached; an already-bound
            // session must ignore it rather than guess it's relevant.
            return;
        }

        if state != SessionState::Working || !event.is_done {
            return;
        }

        let had_task = self.busy.lock().unwrap().task_id.take().is_some();
        if !had_task {
            return; // duplicate completion; task already cleared once
        }

        self.set_state(SessionState::Ready);
        self.touch();
        let text = extract_completion_text(event);
        self.append_history(Role::Agent, text.clone());
        self.emit(SessionEvent::BusyChanged { busy: false });
        self.emit(SessionEvent::TurnComplete { text });
    }
}

fn extract_completion_text(event: &HookEvent) -> String {
    event
        .payload
        .get("message")
        .or_else(|| event.payload.get("text"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn kind_label(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Builder => "builder",
        SessionKind::Reviewer => "reviewer",
    }
}

/// Builds the literal line typed into the shell to launch the agent CLI.
/// `PENDING_TOKEN` travels via the shell's own environment (set at PTY spawn
/// time, inherited by any child it execs), not embedded in this command
/// line. Builder/Reviewer mode itself doesn't affect the launch line beyond
/// whether a `resume_id` is present; the CLI infers fix-vs-new/review-vs-
/// standalone from its own session history once attached.
fn launch_command(kind: SessionKind, resume_id: Option<&str>) -> String {
    match kind {
        SessionKind::Builder => match resume_id {
            Some(id) => format!("builder resume {}", shell_quote(id)),
            None => "builder".to_string(),
        },
        SessionKind::Reviewer => match resume_id {
            Some(id) => format!("reviewer resume {} \"ping\"", shell_quote(id)),
            None => "reviewer \"ping\"".to_string(),
        },
    }
}

/// Resolves `script` against `project_dir`, returning its path only if it
/// exists (spec §6 launch contract: "existence optional, warning if
/// missing").
fn resolve_init_script(project_dir: &str, script: &str) -> Option<std::path::PathBuf> {
    let path = std::path::Path::new(project_dir).join(script);
    path.exists().then_some(path)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_command_builder_new_has_no_resume_argument() {
        assert_eq!(launch_command(SessionKind::Builder, None), "builder");
    }

    #[test]
    fn launch_command_builder_resume_includes_id() {
        assert_eq!(
            launch_command(SessionKind::Builder, Some("abc")),
            "builder resume 'abc'"
        );
    }

    #[test]
    fn launch_command_reviewer_always_pings() {
        assert_eq!(launch_command(SessionKind::Reviewer, None), "reviewer \"ping\"");
        assert_eq!(
            launch_command(SessionKind::Reviewer, Some("r1")),
            "reviewer resume 'r1' \"ping\""
        );
    }

    #[test]
    fn shell_quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn busy_is_derived_from_task_id_presence() {
        let busy = BusyState { task_id: None };
        assert!(busy.task_id.is_none());
        let busy = BusyState { task_id: Some("t1".to_string()) };
        assert!(busy.task_id.is_some());
    }

    #[test]
    fn resolve_init_script_finds_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("init.sh"), b"echo hi\n").unwrap();

        let resolved = resolve_init_script(dir.path().to_str().unwrap(), "init.sh");
        assert_eq!(resolved, Some(dir.path().join("init.sh")));
    }

    #[test]
    fn resolve_init_script_is_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_init_script(dir.path().to_str().unwrap(), "nope.sh"), None);
    }

    #[test]
    fn history_cap_evicts_oldest() {
        let mut history: VecDeque<HistoryEntry> = VecDeque::new();
        for i in 0..(HISTORY_CAP + 1) {
            history.push_back(HistoryEntry { role: Role::User, text: i.to_string() });
            while history.len() > HISTORY_CAP {
                history.pop_front();
            }
        }
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history.front().unwrap().text, "1");
    }
}
