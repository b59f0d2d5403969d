pub mod autofix;
pub mod config;
pub mod error;
pub mod hook_router;
pub mod pairing;
pub mod prompt_matcher;
pub mod pty;
pub mod sequencer;
pub mod session;
pub mod session_manager;

pub use autofix::{AutoFixConfig, AutoFixCtx, Decision, ScenarioTrigger, Stage, StopReason};
pub use error::{PtyError, SessionError};
pub use hook_router::{HookEvent, HookRouter, HookSink};
pub use pairing::PairingRegistry;
pub use prompt_matcher::{AnsiTail, PromptPredicate};
pub use pty::{PtyChannel, PtySpawnOptions};
pub use sequencer::{Sequencer, Step, StepOutcome};
pub use session::{
    BuilderMode, ReviewerMode, Role, Session, SessionEvent, SessionKind, SessionMode,
    SessionParams, SessionState, TabId,
};
pub use session_manager::{
    ConfirmationButton, ConfirmationScenario, ConfirmationTarget, LaunchConfig, ManagerEvent,
    SessionManager,
};
