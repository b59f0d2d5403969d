//! Prompt Matcher (spec §4.2 / C2).
//!
//! A stateless helper that, given a rolling printable "tail" of a PTY's
//! output, tests whether a prompt predicate currently holds. ANSI stripping
//! is implemented with the `vte` crate — the same crate the teacher already
//! depends on for VT-sequence awareness (there it drove a terminal-state
//! backend; here it only drives prompt matching, so the rest of that
//! backend is not carried over).

use std::collections::VecDeque;

use vte::{Params, Parser, Perform};

use super::config::PROMPT_TAIL_WINDOW;

/// Accumulates a bounded, ANSI-stripped "printable residue" of a PTY's
/// output stream. Fed incrementally as chunks arrive; `vte::Parser` keeps
/// its own internal state across chunk boundaries so a CSI/OSC sequence
/// split across two reads still strips correctly.
pub struct AnsiTail {
    parser: Parser,
    performer: TailPerformer,
}

struct TailPerformer {
    buf: VecDeque<char>,
    cap: usize,
}

impl Perform for TailPerformer {
    fn print(&mut self, c: char) {
        self.push(c);
    }

    fn execute(&mut self, byte: u8) {
        // Only newline is kept: it's the only control byte that matters for
        // "tail ends with a prompt glyph" matching. Carriage returns and
        // other control bytes are dropped with the rest of the escape noise.
        if byte == b'\n' {
            self.push('\n');
        }
    }

    // CSI (cursor moves, colors), OSC (window title), and escape sequences
    // are all deliberately ignored -- `Perform`'s default no-op impls for
    // `csi_dispatch`/`osc_dispatch`/`esc_dispatch`/`hook`/`put`/`unhook` are
    // exactly the "ANSI stripping" behavior we want.
}

impl TailPerformer {
    fn push(&mut self, c: char) {
        self.buf.push_back(c);
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }
}

impl AnsiTail {
    /// Creates an empty tail with the given bounded capacity (in chars).
    pub fn new(cap: usize) -> Self {
        Self {
            parser: Parser::new(),
            performer: TailPerformer {
                buf: VecDeque::with_capacity(cap.min(4096)),
                cap,
            },
        }
    }

    /// Creates a tail using the spec's default window (§4.2: "N >= 16KB").
    pub fn with_default_window() -> Self {
        Self::new(PROMPT_TAIL_WINDOW)
    }

    /// Feeds a chunk of raw PTY output into the stripper.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.parser.advance(&mut self.performer, b);
        }
    }

    /// Returns the current printable residue as a string.
    pub fn as_str(&self) -> String {
        self.performer.buf.iter().collect()
    }
}

/// A one-shot prompt predicate, as described in spec §4.2. Evaluated against
/// an `AnsiTail`'s current printable residue; matching itself is a pure
/// function of that residue and the predicate's configuration.
#[derive(Debug, Clone)]
pub enum PromptPredicate {
    /// Tail ends with one of the configured glyphs, followed by optional
    /// whitespace (`$ `, `%`, `> `, `❯`, ...).
    ShellReady { glyphs: Vec<char> },
    /// Tail ends with one of the configured CLI-specific ready markers
    /// (a known greeting line or interactive-prompt glyph), or equals a
    /// single configured literal.
    AgentReady { markers: Vec<String> },
    /// Tail contains (not just ends with) a configured literal anywhere —
    /// used for matching a hook-independent textual marker mid-stream.
    Contains { literal: String },
}

impl PromptPredicate {
    /// Tests the predicate against the given printable residue.
    pub fn matches(&self, tail: &str) -> bool {
        match self {
            PromptPredicate::ShellReady { glyphs } => shell_ready(tail, glyphs),
            PromptPredicate::AgentReady { markers } => agent_ready(tail, markers),
            PromptPredicate::Contains { literal } => tail.contains(literal.as_str()),
        }
    }
}

/// Tail, minus trailing whitespace, ends with one of `glyphs`.
fn shell_ready(tail: &str, glyphs: &[char]) -> bool {
    let trimmed = tail.trim_end_matches([' ', '\t']);
    match trimmed.chars().last() {
        Some(c) => glyphs.contains(&c),
        None => false,
    }
}

/// Tail ends with one of the configured marker strings (checked against the
/// whitespace-trimmed residue so trailing blank lines don't defeat a match).
fn agent_ready(tail: &str, markers: &[String]) -> bool {
    let trimmed = tail.trim_end();
    markers.iter().any(|m| trimmed.ends_with(m.as_str()))
}

/// The default set of shell-ready glyphs (spec §9 open question: "exact set
/// ... varies by agent version"; this is the documented default).
pub fn default_shell_glyphs() -> Vec<char> {
    vec!['$', '%', '>', '❯', '#', '~']
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_color_codes_before_matching() {
        let mut tail = AnsiTail::new(1024);
        tail.feed(b"\x1b[32mready\x1b[0m $ ");
        assert_eq!(tail.as_str(), "ready $ ");
    }

    #[test]
    fn strips_osc_title_sequences() {
        let mut tail = AnsiTail::new(1024);
        tail.feed(b"\x1b]0;my title\x07$ ");
        assert_eq!(tail.as_str(), "$ ");
    }

    #[test]
    fn shell_ready_matches_trailing_glyph_with_whitespace() {
        let glyphs = default_shell_glyphs();
        assert!(shell_ready("user@host:~$ ", &glyphs));
        assert!(shell_ready("user@host:~%", &glyphs));
        assert!(!shell_ready("user@host:~$ echo hi", &glyphs));
    }

    #[test]
    fn agent_ready_matches_configured_marker() {
        let markers = vec!["Codex is ready.".to_string()];
        assert!(agent_ready("some banner\nCodex is ready.\n", &markers));
        assert!(!agent_ready("Codex is busy", &markers));
    }

    #[test]
    fn tail_window_is_bounded() {
        let mut tail = AnsiTail::new(8);
        tail.feed(b"0123456789abcdef");
        assert_eq!(tail.as_str(), "89abcdef");
    }

    #[test]
    fn split_escape_sequence_across_chunks_still_strips() {
        let mut tail = AnsiTail::new(1024);
        tail.feed(b"\x1b[3");
        tail.feed(b"2mready\x1b[0m $");
        assert_eq!(tail.as_str(), "ready $");
    }
}
