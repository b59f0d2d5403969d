//! AutoFix Orchestrator (spec §4.7 / C7).
//!
//! Pure-logic decision function plus the markdown task-list parsing it
//! depends on. Grounded on the polling/diffing decision style of
//! `core::mcp_status_monitor` (now removed): that module's
//! `StatusChange`-style enum returned from a side-effect-free comparison is
//! the shape `decideNext` reuses here, generalized from "did the server
//! list change" to "does the reviewer's checklist still block completion".
//! No PTY or hook dependency at all — every function here is a pure
//! transform over strings and small structs, which is what makes this
//! module exhaustively unit-testable.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Fixing,
    Reviewing,
}

/// Tracks one reviewer's active Review→Fix loop. Owned by the Session
/// Manager, one per reviewer tab with an active loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFixCtx {
    pub reviewer_tab: String,
    pub builder_tab: String,
    pub stage: Stage,
    pub cycle_count: u32,
    pub active: bool,
}

impl AutoFixCtx {
    pub fn new(reviewer_tab: impl Into<String>, builder_tab: impl Into<String>) -> Self {
        Self {
            reviewer_tab: reviewer_tab.into(),
            builder_tab: builder_tab.into(),
            stage: Stage::Fixing,
            cycle_count: 1,
            active: true,
        }
    }
}

/// One recognized scenario: a message is "in scope" for AutoFix only if it
/// begins with one of these trigger markers. The marker line itself is
/// excluded from item parsing.
#[derive(Debug, Clone)]
pub struct ScenarioTrigger {
    pub key: String,
    pub marker: String,
}

#[derive(Debug, Clone, Default)]
pub struct AutoFixConfig {
    pub scenarios: Vec<ScenarioTrigger>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    NoScenarioMatch,
    ZeroCheckboxes,
    MaxCycles { remaining_count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Stop {
        reason: StopReason,
    },
    Complete {
        cycle_count: u32,
    },
    Continue {
        next_cycle_count: u32,
        items: Vec<String>,
        scenario_key: String,
    },
}

/// A parsed markdown task-list item.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChecklistItem {
    text: String,
    checked: bool,
}

fn checkbox_line_regex() -> Regex {
    Regex::new(r"^\s*-\s*\[( |x|X)\]\s+(.+)$").expect("static checkbox regex is valid")
}

fn priority_regex() -> Regex {
    Regex::new(r"(?i)\bp0\b|\bp1\b").expect("static priority regex is valid")
}

/// Parses markdown task-list lines out of `text` (spec §4.7 parsing rules):
/// fenced code blocks are skipped entirely, and `skip_first_line` (the
/// scenario's trigger marker) is never treated as an item even if it
/// happens to look like one.
fn parse_checklist(text: &str, skip_first_line: Option<&str>) -> Vec<ChecklistItem> {
    let checkbox_re = checkbox_line_regex();
    let mut items = Vec::new();
    let mut in_fence = false;

    for (i, line) in text.lines().enumerate() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if i == 0 {
            if let Some(marker) = skip_first_line {
                if line.trim() == marker.trim() {
                    continue;
                }
            }
        }
        if let Some(caps) = checkbox_re.captures(line) {
            let checked = matches!(&caps[1], "x" | "X");
            let text = caps[2].trim().to_string();
            items.push(ChecklistItem { text, checked });
        }
    }

    items
}

/// Strips `*`, `_`, `[`, `]`, and whitespace, then checks for a `P0`/`P1`
/// token at a word boundary, case-insensitively (spec §4.7 priority rule).
fn has_blocking_priority(item_text: &str) -> bool {
    let stripped: String = item_text
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '[' | ']'))
        .collect();
    priority_regex().is_match(stripped.trim())
}

/// Finds the scenario whose trigger marker is a prefix of `result_text`
/// (after trimming leading whitespace), if any.
fn match_scenario<'a>(result_text: &str, config: &'a AutoFixConfig) -> Option<&'a ScenarioTrigger> {
    let trimmed = result_text.trim_start();
    config.scenarios.iter().find(|s| trimmed.starts_with(s.marker.trim_start()))
}

/// The core AutoFix decision, re-evaluated after every Reviewer turn
/// completes while a loop is active (spec §4.7).
pub fn decide_next(result_text: &str, state: &AutoFixCtx, config: &AutoFixConfig, max_cycles: u32) -> Decision {
    let Some(scenario) = match_scenario(result_text, config) else {
        return Decision::Stop { reason: StopReason::NoScenarioMatch };
    };

    let items = parse_checklist(result_text, Some(&scenario.marker));
    if items.is_empty() {
        return Decision::Stop { reason: StopReason::ZeroCheckboxes };
    }

    let blocking: Vec<String> = items
        .iter()
        .filter(|item| !item.checked && has_blocking_priority(&item.text))
        .map(|item| item.text.clone())
        .collect();

    if blocking.is_empty() {
        return Decision::Complete { cycle_count: state.cycle_count };
    }

    if state.cycle_count >= max_cycles {
        return Decision::Stop {
            reason: StopReason::MaxCycles { remaining_count: blocking.len() },
        };
    }

    Decision::Continue {
        next_cycle_count: state.cycle_count + 1,
        items: blocking,
        scenario_key: scenario.key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutoFixConfig {
        AutoFixConfig {
            scenarios: vec![ScenarioTrigger {
                key: "review-complete".to_string(),
                marker: "## Review Results".to_string(),
            }],
        }
    }

    fn ctx(cycle_count: u32) -> AutoFixCtx {
        AutoFixCtx {
            reviewer_tab: "r1".to_string(),
            builder_tab: "b1".to_string(),
            stage: Stage::Reviewing,
            cycle_count,
            active: true,
        }
    }

    #[test]
    fn no_scenario_match_when_text_lacks_a_known_trigger() {
        let decision = decide_next("Looks fine to me, nothing to report.", &ctx(1), &config(), 10);
        assert_eq!(decision, Decision::Stop { reason: StopReason::NoScenarioMatch });
    }

    #[test]
    fn zero_checkboxes_when_trigger_matches_but_no_items_found() {
        let text = "## Review Results\nEverything passed, no findings.";
        let decision = decide_next(text, &ctx(1), &config(), 10);
        assert_eq!(decision, Decision::Stop { reason: StopReason::ZeroCheckboxes });
    }

    #[test]
    fn complete_when_no_unchecked_p0_or_p1_items_remain() {
        let text = "## Review Results\n- [x] P0 fix the null deref\n- [ ] P2 rename a variable\n";
        let decision = decide_next(text, &ctx(3), &config(), 10);
        assert_eq!(decision, Decision::Complete { cycle_count: 3 });
    }

    #[test]
    fn continue_with_unchecked_p0_and_p1_items_in_document_order() {
        let text = "## Review Results\n- [ ] P1 handle the empty-input case\n- [x] P0 already fixed\n- [ ] P0 missing error check\n";
        let decision = decide_next(text, &ctx(2), &config(), 10);
        assert_eq!(
            decision,
            Decision::Continue {
                next_cycle_count: 3,
                items: vec![
                    "P1 handle the empty-input case".to_string(),
                    "P0 missing error check".to_string(),
                ],
                scenario_key: "review-complete".to_string(),
            }
        );
    }

    #[test]
    fn max_cycles_stop_when_cap_reached_with_blockers_remaining() {
        let text = "## Review Results\n- [ ] P0 still broken\n";
        let decision = decide_next(text, &ctx(10), &config(), 10);
        assert_eq!(
            decision,
            Decision::Stop { reason: StopReason::MaxCycles { remaining_count: 1 } }
        );
    }

    #[test]
    fn fenced_code_block_checkboxes_are_not_parsed_as_items() {
        let text = "## Review Results\n```\n- [ ] P0 this is example markdown, not a real item\n```\n- [ ] P1 this one is real\n";
        let items = parse_checklist(text, Some("## Review Results"));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "P1 this one is real");
    }

    #[test]
    fn trigger_marker_line_itself_is_never_parsed_as_an_item() {
        let text = "## Review Results\n- [ ] P0 genuine finding\n";
        let items = parse_checklist(text, Some("## Review Results"));
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn priority_detection_ignores_markdown_emphasis_markers() {
        assert!(has_blocking_priority("**P0** critical bug"));
        assert!(has_blocking_priority("_P1_ minor issue"));
        assert!(!has_blocking_priority("P22 is not a real priority token"));
        assert!(!has_blocking_priority("no priority mentioned here"));
    }

    #[test]
    fn p2_and_lower_never_block_completion() {
        let text = "## Review Results\n- [ ] P2 cosmetic nit\n- [ ] P3 nice to have\n";
        let decision = decide_next(text, &ctx(1), &config(), 10);
        assert_eq!(decision, Decision::Complete { cycle_count: 1 });
    }
}
