//! Tunable constants (spec §4.9). Resolved as documented defaults rather
//! than magic literals scattered through the orchestration core — per
//! spec §9's note that the bracketed-paste threshold in particular "MUST
//! be exposed as a constant, not a magic literal". Operator overrides are
//! persisted through `tauri-plugin-store`, the same way the teacher
//! persists its own settings; these `const`s are the shipped defaults.

use std::time::Duration;

/// Hard cap on AutoFix Review→Fix cycles (spec §4.7/§8).
pub const MAX_CYCLES: u32 = 10;

/// Maximum number of `(role, text)` entries retained per session history
/// (spec §3/§8: "201st history append drops entry 0; length stays 200").
pub const HISTORY_CAP: usize = 200;

/// Payloads at or under this many bytes use bracketed paste; anything
/// larger uses a direct write (spec §4.3/§8: "exactly 500 bytes uses
/// bracketed paste; 501 uses direct write").
pub const BRACKET_PASTE_THRESHOLD: usize = 500;

/// Handshake timeout for Builder sessions (spec §4.4/§5).
pub const BUILDER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Handshake timeout for Reviewer sessions (spec §4.4/§5) — long enough to
/// cover the "ping" round trip through a cold-started CLI.
pub const REVIEWER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default per-step timeout for non-handshake sequencer steps.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Rolling tail window used by the Prompt Matcher (spec §4.2: "N >= 16KB").
pub const PROMPT_TAIL_WINDOW: usize = 16 * 1024;

/// Candidate port range the Hook Router binds from, trying each in turn
/// (spec §6 documents 18888 as the default; the range covers the "already
/// in use by another instance" case the teacher's `find_and_bind_port`
/// idiom exists for).
pub const HOOK_PORT_RANGE: (u16, u16) = (18888, 18898);

/// Debounce window for the coalesced file-tree "refresh" advisory signal
/// (spec §5/§6: "debounce (>= 500 ms)").
pub const REFRESH_DEBOUNCE: Duration = Duration::from_millis(500);
