//! Session Manager (spec §4.8 / C8).
//!
//! Owns every `Session`, the `PairingRegistry`, and the active `AutoFixCtx`
//! contexts; bridges Session-level events into the AutoFix stage machine
//! and into manager-level events the Tauri command layer forwards to the
//! frontend. Grounded on the teacher's `SessionManager` for the "DashMap of
//! entities keyed by id, with a project-path index alongside it" shape
//! (`get_sessions_for_project`/`remove_sessions_for_project`), generalized
//! from a flat config map into the full Session/Pairing/AutoFix aggregate
//! the confirmation-card and review-loop flows need.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use super::autofix::{decide_next, AutoFixConfig, AutoFixCtx, Decision, Stage, StopReason};
use super::config::MAX_CYCLES;
use super::error::SessionError;
use super::hook_router::{triggers_refresh, HookRouter};
use super::pairing::PairingRegistry;
use super::session::{
    BuilderMode, ReviewerMode, Session, SessionEvent, SessionKind, SessionMode, SessionParams,
    SessionState, TabId,
};

const EVENT_CHANNEL_CAPACITY: usize = 128;
const REVIEW_AGAIN_PROMPT: &str = "The fix has been applied. Please re-review the change.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationTarget {
    CurrentReviewer,
    PairedBuilder,
}

#[derive(Debug, Clone)]
pub struct ConfirmationButton {
    pub label: String,
    pub action: String,
    pub style: String,
    pub message_template: Option<String>,
    pub target: ConfirmationTarget,
    pub requires_selection: bool,
}

/// One scenario's confirmation-card configuration: the trigger marker that
/// identifies it (shared with `autofix::ScenarioTrigger::marker`) plus the
/// buttons offered to the operator.
#[derive(Debug, Clone)]
pub struct ConfirmationScenario {
    pub key: String,
    pub marker: String,
    pub buttons: Vec<ConfirmationButton>,
}

/// Static launch configuration shared by every session the manager opens.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub shell_path: String,
    pub init_script: Option<String>,
    pub builder_ready_markers: Vec<String>,
    pub reviewer_ready_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum ManagerEvent {
    SessionReady { tab_id: TabId },
    SessionBusy { tab_id: TabId, busy: bool },
    TurnComplete { tab_id: TabId, text: String },
    SessionExited { tab_id: TabId, code: i32 },
    AutofixState { reviewer_tab: TabId, ctx: Option<AutoFixCtx> },
    Celebration { reviewer_tab: TabId },
    RefreshExternal,
}

pub struct SessionManager {
    sessions: DashMap<TabId, Arc<Session>>,
    project_dirs: DashMap<TabId, String>,
    pairing: PairingRegistry,
    autofix: DashMap<TabId, AutoFixCtx>,
    router: Arc<HookRouter>,
    launch: LaunchConfig,
    confirmation_scenarios: Vec<ConfirmationScenario>,
    events: broadcast::Sender<ManagerEvent>,
}

impl SessionManager {
    pub fn new(
        router: Arc<HookRouter>,
        launch: LaunchConfig,
        confirmation_scenarios: Vec<ConfirmationScenario>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            sessions: DashMap::new(),
            project_dirs: DashMap::new(),
            pairing: PairingRegistry::new(),
            autofix: DashMap::new(),
            router,
            launch,
            confirmation_scenarios,
            events,
        });
        manager.spawn_refresh_debouncer();
        manager
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn autofix_config(&self) -> AutoFixConfig {
        AutoFixConfig {
            scenarios: self
                .confirmation_scenarios
                .iter()
                .map(|s| super::autofix::ScenarioTrigger { key: s.key.clone(), marker: s.marker.clone() })
                .collect(),
        }
    }

    pub async fn open_builder(
        self: &Arc<Self>,
        mode: BuilderMode,
        change_id: Option<String>,
        resume_id: Option<String>,
        project_dir: String,
    ) -> Result<TabId, SessionError> {
        self.open_session(
            SessionKind::Builder,
            SessionMode::Builder(mode),
            change_id,
            resume_id,
            project_dir,
            self.launch.builder_ready_markers.clone(),
        )
        .await
    }

    pub async fn open_reviewer(
        self: &Arc<Self>,
        mode: ReviewerMode,
        change_id: Option<String>,
        resume_id: Option<String>,
        project_dir: String,
    ) -> Result<TabId, SessionError> {
        self.open_session(
            SessionKind::Reviewer,
            SessionMode::Reviewer(mode),
            change_id,
            resume_id,
            project_dir,
            self.launch.reviewer_ready_markers.clone(),
        )
        .await
    }

    async fn open_session(
        self: &Arc<Self>,
        kind: SessionKind,
        mode: SessionMode,
        change_id: Option<String>,
        resume_id: Option<String>,
        project_dir: String,
        agent_ready_markers: Vec<String>,
    ) -> Result<TabId, SessionError> {
        let tab_id = TabId(uuid::Uuid::new_v4().to_string());
        let params = SessionParams {
            tab_id: tab_id.clone(),
            kind,
            mode,
            change_id,
            resume_id,
            project_dir: project_dir.clone(),
            shell_path: self.launch.shell_path.clone(),
            init_script: self.launch.init_script.clone(),
            agent_ready_markers,
        };

        let session = Session::open(params, self.router.clone()).await?;
        self.sessions.insert(tab_id.clone(), session.clone());
        self.project_dirs.insert(tab_id.clone(), project_dir);
        self.spawn_event_bridge(tab_id.clone(), session);
        Ok(tab_id)
    }

    fn spawn_event_bridge(self: &Arc<Self>, tab_id: TabId, session: Arc<Session>) {
        let manager = self.clone();
        let mut rx = session.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                manager.on_session_event(&tab_id, event).await;
            }
        });
    }

    async fn on_session_event(self: &Arc<Self>, tab_id: &TabId, event: SessionEvent) {
        match event {
            SessionEvent::Ready => self.emit(ManagerEvent::SessionReady { tab_id: tab_id.clone() }),
            SessionEvent::BusyChanged { busy } => {
                self.emit(ManagerEvent::SessionBusy { tab_id: tab_id.clone(), busy })
            }
            SessionEvent::TurnComplete { text } => {
                self.emit(ManagerEvent::TurnComplete { tab_id: tab_id.clone(), text: text.clone() });
                self.advance_autofix(tab_id, &text).await;
            }
            SessionEvent::Exit { code } => {
                // Unprompted exit: any AutoFix loop resting on this tab
                // must not keep waiting on a turn that will never arrive
                // (spec §4.4: "do not auto-restart").
                self.deactivate_autofix_touching(tab_id);
                self.emit(ManagerEvent::SessionExited { tab_id: tab_id.clone(), code });
            }
            SessionEvent::Stopped { .. } | SessionEvent::Bound { .. } | SessionEvent::HistoryAppended(_) => {}
        }
    }

    /// Drives the AutoFix stage machine off a completed turn (spec §4.7
    /// stage transitions). `tab_id` may be either half of an active pair:
    /// a Builder finishing its Fix turn, or the Reviewer finishing its
    /// re-review.
    async fn advance_autofix(self: &Arc<Self>, tab_id: &TabId, result_text: &str) {
        let fixing_reviewer = self
            .autofix
            .iter()
            .find(|e| e.value().builder_tab == tab_id.0 && e.value().stage == Stage::Fixing)
            .map(|e| e.key().clone());

        if let Some(reviewer_tab) = fixing_reviewer {
            let Some(reviewer) = self.sessions.get(&reviewer_tab).map(|e| e.value().clone()) else {
                self.autofix.remove(&reviewer_tab);
                return;
            };
            if reviewer.submit(REVIEW_AGAIN_PROMPT).is_ok() {
                if let Some(mut ctx) = self.autofix.get_mut(&reviewer_tab) {
                    ctx.stage = Stage::Reviewing;
                }
                let ctx = self.autofix.get(&reviewer_tab).map(|e| e.value().clone());
                self.emit(ManagerEvent::AutofixState { reviewer_tab, ctx });
            } else {
                self.autofix.remove(&reviewer_tab);
                self.emit(ManagerEvent::AutofixState { reviewer_tab, ctx: None });
            }
            return;
        }

        let Some(ctx) = self.autofix.get(tab_id).map(|e| e.value().clone()) else {
            return;
        };
        if ctx.stage != Stage::Reviewing {
            return;
        }

        let decision = decide_next(result_text, &ctx, &self.autofix_config(), MAX_CYCLES);
        match decision {
            Decision::Continue { next_cycle_count, items, .. } => {
                let builder_tab = TabId(ctx.builder_tab.clone());
                let message = format_fix_message(&items);
                let dispatched = self
                    .sessions
                    .get(&builder_tab)
                    .map(|e| e.value().submit(&message).is_ok())
                    .unwrap_or(false);

                if dispatched {
                    if let Some(mut entry) = self.autofix.get_mut(tab_id) {
                        entry.cycle_count = next_cycle_count;
                        entry.stage = Stage::Fixing;
                    }
                    let ctx = self.autofix.get(tab_id).map(|e| e.value().clone());
                    self.emit(ManagerEvent::AutofixState { reviewer_tab: tab_id.clone(), ctx });
                } else {
                    // Send-failure handling (spec §4.7): do not remain active.
                    self.autofix.remove(tab_id);
                    self.emit(ManagerEvent::AutofixState { reviewer_tab: tab_id.clone(), ctx: None });
                }
            }
            Decision::Complete { .. } => {
                self.autofix.remove(tab_id);
                self.emit(ManagerEvent::Celebration { reviewer_tab: tab_id.clone() });
            }
            Decision::Stop { reason } => {
                self.autofix.remove(tab_id);
                if let Some(reviewer) = self.sessions.get(tab_id) {
                    reviewer.value().append_system_note(describe_stop_reason(&reason));
                }
                self.emit(ManagerEvent::AutofixState { reviewer_tab: tab_id.clone(), ctx: None });
            }
        }
    }

    /// Returns the live `Session` for `tab_id`, if it's still open. Used by
    /// the Tauri command layer to bridge raw PTY output/exit events without
    /// `Session` or `SessionManager` taking a dependency on `tauri`.
    pub fn session(&self, tab_id: &TabId) -> Option<Arc<Session>> {
        self.sessions.get(tab_id).map(|e| e.value().clone())
    }

    /// Snapshot of a session's current history, for the frontend to
    /// rehydrate a tab after reload.
    pub fn history(&self, tab_id: &TabId) -> Option<Vec<super::session::HistoryEntry>> {
        self.sessions.get(tab_id).map(|e| e.value().history())
    }

    pub fn send(&self, tab_id: &TabId, text: &str) -> bool {
        self.sessions.get(tab_id).map(|e| e.value().submit(text).is_ok()).unwrap_or(false)
    }

    pub fn stop(&self, tab_id: &TabId) -> bool {
        self.sessions.get(tab_id).map(|e| e.value().stop().is_ok()).unwrap_or(false)
    }

    pub fn resize(&self, tab_id: &TabId, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.sessions
            .get(tab_id)
            .ok_or_else(|| SessionError::NotFound(tab_id.to_string()))?
            .value()
            .resize(cols, rows)
    }

    /// Every tab currently open against `project_dir` (spec §4.8 supplement:
    /// project grouping, mirroring the teacher's
    /// `get_sessions_for_project`). Lets the frontend list or close every
    /// session for one project at once.
    pub fn sessions_for_project(&self, project_dir: &str) -> Vec<TabId> {
        self.project_dirs
            .iter()
            .filter(|e| e.value() == project_dir)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Closes every session open against `project_dir` (spec §4.8
    /// supplement). Best-effort: a failure closing one tab doesn't stop the
    /// rest from being torn down.
    pub async fn close_project(&self, project_dir: &str) -> Result<(), SessionError> {
        for tab_id in self.sessions_for_project(project_dir) {
            self.close_session(&tab_id).await?;
        }
        Ok(())
    }

    /// Tears down a session: AutoFix state first, then pairing, then the
    /// hook router's routes, then the session itself (spec §4.8
    /// guarantees). Idempotent — closing an unknown tab is a no-op.
    pub async fn close_session(&self, tab_id: &TabId) -> Result<(), SessionError> {
        let Some((_, session)) = self.sessions.remove(tab_id) else {
            return Ok(());
        };

        self.deactivate_autofix_touching(tab_id);
        self.pairing.unbind(tab_id);
        self.router
            .unregister(tab_id, session.pending_token().as_deref(), session.cli_session_id().as_deref())
            .await;
        session.close().await;
        self.project_dirs.remove(tab_id);
        Ok(())
    }

    fn deactivate_autofix_touching(&self, tab_id: &TabId) {
        if self.autofix.remove(tab_id).is_some() {
            return;
        }
        let matching_reviewer = self
            .autofix
            .iter()
            .find(|e| e.value().builder_tab == tab_id.0)
            .map(|e| e.key().clone());
        if let Some(reviewer_tab) = matching_reviewer {
            self.autofix.remove(&reviewer_tab);
        }
    }

    /// Binds a reviewer to a builder, auto-creating a `Fix`-mode Builder if
    /// none was supplied (spec §4.8 `pair`).
    pub async fn pair(self: &Arc<Self>, reviewer_tab: TabId, builder_tab: Option<TabId>) -> Result<TabId, SessionError> {
        let builder_tab = match builder_tab {
            Some(b) => b,
            None => {
                let reviewer = self
                    .sessions
                    .get(&reviewer_tab)
                    .ok_or_else(|| SessionError::NotFound(reviewer_tab.to_string()))?
                    .value()
                    .clone();
                let change_id = reviewer.change_id().map(str::to_string);
                let project_dir = self
                    .project_dirs
                    .get(&reviewer_tab)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();
                self.open_builder(BuilderMode::Fix, change_id, None, project_dir).await?
            }
        };
        self.pairing.bind(&reviewer_tab, &builder_tab);
        Ok(builder_tab)
    }

    /// Activates an AutoFix loop (spec §4.8 `startAutoFix`): pairs if
    /// needed, dispatches the initial fix items, and only commits `active`
    /// state if that dispatch actually succeeds.
    pub async fn start_autofix(self: &Arc<Self>, reviewer_tab: TabId, initial_items: Vec<String>) -> Result<(), SessionError> {
        let builder_tab = match self.pairing.peer(&reviewer_tab) {
            Some(b) => b,
            None => self.pair(reviewer_tab.clone(), None).await?,
        };

        let builder = self
            .sessions
            .get(&builder_tab)
            .ok_or_else(|| SessionError::NotFound(builder_tab.to_string()))?
            .value()
            .clone();

        if builder.state() != SessionState::Ready {
            return Err(SessionError::SendFailed(builder_tab.to_string()));
        }

        let message = format_fix_message(&initial_items);
        builder.submit(&message)?;

        let ctx = AutoFixCtx::new(reviewer_tab.0.clone(), builder_tab.0.clone());
        self.autofix.insert(reviewer_tab.clone(), ctx.clone());
        self.emit(ManagerEvent::AutofixState { reviewer_tab, ctx: Some(ctx) });
        Ok(())
    }

    /// Handles the confirmation-card protocol (spec §6): look up the
    /// button's action, format its template (if any), and dispatch to the
    /// configured target.
    pub async fn confirm_selection(
        self: &Arc<Self>,
        reviewer_tab: TabId,
        action: &str,
        items: Vec<String>,
        change_id: Option<String>,
    ) -> Result<(), SessionError> {
        let button = self
            .confirmation_scenarios
            .iter()
            .flat_map(|s| s.buttons.iter())
            .find(|b| b.action == action)
            .cloned()
            .ok_or_else(|| SessionError::TemplateMissing(action.to_string()))?;

        if action == "cancel" {
            return Ok(());
        }
        if action == "auto_fix" {
            return self.start_autofix(reviewer_tab, items).await;
        }

        let template = button
            .message_template
            .as_ref()
            .ok_or_else(|| SessionError::TemplateMissing(action.to_string()))?;
        let message = template
            .replace("{selected_items}", &format_items(&items))
            .replace("{changeId}", change_id.as_deref().unwrap_or(""));

        let target_tab = match button.target {
            ConfirmationTarget::CurrentReviewer => reviewer_tab.clone(),
            ConfirmationTarget::PairedBuilder => self
                .pairing
                .peer(&reviewer_tab)
                .ok_or_else(|| SessionError::NotPaired(reviewer_tab.to_string()))?,
        };

        self.sessions
            .get(&target_tab)
            .ok_or_else(|| SessionError::NotFound(target_tab.to_string()))?
            .value()
            .submit(&message)?;
        Ok(())
    }

    /// Spawns the debounced `refresh` advisory signal (spec §5/§6): any
    /// number of qualifying hook events arriving within `REFRESH_DEBOUNCE`
    /// of each other coalesce into one `RefreshExternal` emission.
    fn spawn_refresh_debouncer(self: &Arc<Self>) {
        let manager = self.clone();
        let mut raw = self.router.subscribe_raw_events();
        tokio::spawn(async move {
            loop {
                let event = match raw.recv().await {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !triggers_refresh(&event) {
                    continue;
                }
                // Drain anything else that arrives within the debounce
                // window before emitting once.
                loop {
                    match tokio::time::timeout(super::config::REFRESH_DEBOUNCE, raw.recv()).await {
                        Ok(Ok(_)) => continue,
                        _ => break,
                    }
                }
                manager.emit(ManagerEvent::RefreshExternal);
            }
        });
    }
}

fn format_items(items: &[String]) -> String {
    items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
}

fn format_fix_message(items: &[String]) -> String {
    format!("Please address the following review findings:\n{}", format_items(items))
}

fn describe_stop_reason(reason: &StopReason) -> String {
    match reason {
        StopReason::NoScenarioMatch => "auto-fix stopped: no scenario match".to_string(),
        StopReason::ZeroCheckboxes => "auto-fix stopped: no checklist items found".to_string(),
        StopReason::MaxCycles { remaining_count } => {
            format!("auto-fix stopped: cycle cap reached with {remaining_count} item(s) remaining")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_items_joins_with_dash_prefix() {
        let items = vec!["fix the null check".to_string(), "add a test".to_string()];
        assert_eq!(format_items(&items), "- fix the null check\n- add a test");
    }

    #[test]
    fn describe_stop_reason_covers_every_variant() {
        assert!(describe_stop_reason(&StopReason::NoScenarioMatch).contains("no scenario match"));
        assert!(describe_stop_reason(&StopReason::ZeroCheckboxes).contains("no checklist items"));
        assert!(describe_stop_reason(&StopReason::MaxCycles { remaining_count: 2 }).contains("2 item"));
    }
}
