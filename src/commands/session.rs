//! Tauri command surface for the Session Manager (spec §6).
//!
//! Thin `#[tauri::command]` wrappers around `SessionManager`, plus the
//! event-forwarding bridges that turn `PtyChannel`/`SessionManager` streams
//! into Tauri events the frontend listens on. Mirrors the teacher's own
//! split between "plain data-registry commands" (`commands::session`, kept
//! for the old `SessionConfig` surface) and the PTY-output event bridge the
//! teacher wired up in `spawn_shell`.

use std::sync::Arc;

use tauri::{AppHandle, Emitter, State};

use crate::core::session::{BuilderMode, HistoryEntry, ReviewerMode, SessionState, TabId};
use crate::core::{SessionError, SessionManager};

/// Emits `pty-output-{tab_id}` and `pty-exit-{tab_id}`, matching the
/// teacher's per-session event naming convention, for as long as the
/// session's channel lives.
fn spawn_output_bridge(app: AppHandle, manager: Arc<SessionManager>, tab_id: TabId) {
    tokio::spawn(async move {
        let Some(session) = manager.session(&tab_id) else { return };
        let channel = session.channel().clone();
        let mut output_rx = channel.subscribe_output();
        let mut exit_rx = channel.subscribe_exit();

        loop {
            tokio::select! {
                chunk = output_rx.recv() => {
                    match chunk {
                        Ok(bytes) => {
                            let _ = app.emit(&format!("pty-output-{tab_id}"), bytes.to_vec());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = exit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(code) = *exit_rx.borrow() {
                        let _ = app.emit(&format!("pty-exit-{tab_id}"), code);
                        break;
                    }
                }
            }
        }
    });
}

/// Forwards every `ManagerEvent` to the frontend as `duet-manager-event`.
/// Started once from `lib.rs::run`'s `setup` hook.
pub fn spawn_manager_event_bridge(app: AppHandle, manager: Arc<SessionManager>) {
    let mut rx = manager.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let _ = app.emit("duet-manager-event", &event);
        }
    });
}

#[tauri::command]
pub async fn open_builder(
    app: AppHandle,
    state: State<'_, Arc<SessionManager>>,
    mode: BuilderMode,
    change_id: Option<String>,
    resume_id: Option<String>,
    project_dir: String,
) -> Result<TabId, SessionError> {
    let manager = state.inner().clone();
    let tab_id = manager.open_builder(mode, change_id, resume_id, project_dir).await?;
    spawn_output_bridge(app, manager, tab_id.clone());
    Ok(tab_id)
}

#[tauri::command]
pub async fn open_reviewer(
    app: AppHandle,
    state: State<'_, Arc<SessionManager>>,
    mode: ReviewerMode,
    change_id: Option<String>,
    resume_id: Option<String>,
    project_dir: String,
) -> Result<TabId, SessionError> {
    let manager = state.inner().clone();
    let tab_id = manager.open_reviewer(mode, change_id, resume_id, project_dir).await?;
    spawn_output_bridge(app, manager, tab_id.clone());
    Ok(tab_id)
}

#[tauri::command]
pub async fn close_session(state: State<'_, Arc<SessionManager>>, tab_id: TabId) -> Result<(), SessionError> {
    state.inner().close_session(&tab_id).await
}

#[tauri::command]
pub async fn send_to_session(state: State<'_, Arc<SessionManager>>, tab_id: TabId, text: String) -> Result<bool, SessionError> {
    Ok(state.inner().send(&tab_id, &text))
}

#[tauri::command]
pub async fn stop_session(state: State<'_, Arc<SessionManager>>, tab_id: TabId) -> Result<bool, SessionError> {
    Ok(state.inner().stop(&tab_id))
}

#[tauri::command]
pub async fn resize_session(
    state: State<'_, Arc<SessionManager>>,
    tab_id: TabId,
    cols: u16,
    rows: u16,
) -> Result<(), SessionError> {
    state.inner().resize(&tab_id, cols, rows)
}

#[tauri::command]
pub async fn pair_sessions(
    state: State<'_, Arc<SessionManager>>,
    reviewer_tab: TabId,
    builder_tab: Option<TabId>,
) -> Result<TabId, SessionError> {
    state.inner().pair(reviewer_tab, builder_tab).await
}

#[tauri::command]
pub async fn start_autofix(
    state: State<'_, Arc<SessionManager>>,
    reviewer_tab: TabId,
    initial_items: Vec<String>,
) -> Result<(), SessionError> {
    state.inner().start_autofix(reviewer_tab, initial_items).await
}

#[tauri::command]
pub async fn confirm_selection(
    state: State<'_, Arc<SessionManager>>,
    reviewer_tab: TabId,
    action: String,
    items: Vec<String>,
    change_id: Option<String>,
) -> Result<(), SessionError> {
    state.inner().confirm_selection(reviewer_tab, &action, items, change_id).await
}

#[tauri::command]
pub async fn sessions_for_project(state: State<'_, Arc<SessionManager>>, project_dir: String) -> Result<Vec<TabId>, SessionError> {
    Ok(state.inner().sessions_for_project(&project_dir))
}

#[tauri::command]
pub async fn close_project_sessions(state: State<'_, Arc<SessionManager>>, project_dir: String) -> Result<(), SessionError> {
    state.inner().close_project(&project_dir).await
}

#[tauri::command]
pub async fn get_session_history(
    state: State<'_, Arc<SessionManager>>,
    tab_id: TabId,
) -> Result<Vec<HistoryEntry>, SessionError> {
    state
        .inner()
        .history(&tab_id)
        .ok_or_else(|| SessionError::NotFound(tab_id.to_string()))
}

#[tauri::command]
pub async fn get_session_state(
    state: State<'_, Arc<SessionManager>>,
    tab_id: TabId,
) -> Result<SessionState, SessionError> {
    state
        .inner()
        .session(&tab_id)
        .map(|s| s.state())
        .ok_or_else(|| SessionError::NotFound(tab_id.to_string()))
}
