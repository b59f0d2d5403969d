mod commands;
mod core;

use std::sync::Arc;

use tauri::Manager;

use core::{ConfirmationButton, ConfirmationScenario, ConfirmationTarget, HookRouter, LaunchConfig, SessionManager};

/// Default CLI-specific ready markers the Builder/Reviewer launch step waits
/// on once it switches from watching the shell's own prompt to watching for
/// the agent CLI's own banner (spec §4.2: "a known greeting ... or an
/// interactive-prompt glyph"). Deliberately disjoint from
/// `core::prompt_matcher::default_shell_glyphs()`'s bare punctuation: a CLI
/// whose startup banner happens to end in `$`/`#`/`>` must not satisfy
/// agent-ready before it has actually printed its own greeting.
fn default_agent_ready_markers() -> Vec<String> {
    vec!["Codex is ready.".to_string()]
}

/// The one confirmation-card scenario shipped by default: a Reviewer
/// completion beginning with `[fix_confirmation]` offers to either hand the
/// findings to the paired Builder (`auto_fix`) or dismiss them.
fn default_confirmation_scenarios() -> Vec<ConfirmationScenario> {
    vec![ConfirmationScenario {
        key: "fix_confirmation".to_string(),
        marker: "[fix_confirmation]".to_string(),
        buttons: vec![
            ConfirmationButton {
                label: "Send to Builder".to_string(),
                action: "auto_fix".to_string(),
                style: "primary".to_string(),
                message_template: None,
                target: ConfirmationTarget::PairedBuilder,
                requires_selection: true,
            },
            ConfirmationButton {
                label: "Dismiss".to_string(),
                action: "cancel".to_string(),
                style: "secondary".to_string(),
                message_template: None,
                target: ConfirmationTarget::CurrentReviewer,
                requires_selection: false,
            },
        ],
    }]
}

/// Entry point for the Tauri application.
///
/// Starts the Hook Router's HTTP listener, builds the Session Manager on
/// top of it, injects both as managed state, and mounts every IPC command
/// handler for the Builder/Reviewer session surface.
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    env_logger::init();

    tauri::Builder::default()
        .plugin(tauri_plugin_store::Builder::new().build())
        .setup(|app| {
            let router = Arc::new(HookRouter::new());
            let launch = LaunchConfig {
                shell_path: std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
                init_script: Some(".duet-init.sh".to_string()),
                builder_ready_markers: default_agent_ready_markers(),
                reviewer_ready_markers: default_agent_ready_markers(),
            };
            let manager = SessionManager::new(router.clone(), launch, default_confirmation_scenarios());

            let router_for_setup = router.clone();
            tauri::async_runtime::spawn(async move {
                match router_for_setup.start().await {
                    Some(port) => log::info!("hook router listening on port {port}"),
                    None => log::error!("hook router failed to bind any port in its configured range"),
                }
            });

            commands::session::spawn_manager_event_bridge(app.handle().clone(), manager.clone());

            app.manage(router);
            app.manage(manager);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::session::open_builder,
            commands::session::open_reviewer,
            commands::session::close_session,
            commands::session::send_to_session,
            commands::session::stop_session,
            commands::session::resize_session,
            commands::session::pair_sessions,
            commands::session::start_autofix,
            commands::session::confirm_selection,
            commands::session::sessions_for_project,
            commands::session::close_project_sessions,
            commands::session::get_session_history,
            commands::session::get_session_state,
        ])
        .run(tauri::generate_context!())
        .expect("error while running Duet");
}
