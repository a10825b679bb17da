//! Deterministic complexity scoring.
//!
//! The score is an additive, saturating heuristic over the message text and
//! the tail of the conversation.  Exact weights matter less than the
//! ordering they produce: trivial chit-chat lands below 40, code and edit
//! tasks land in 40–59, heavy analysis and crash triage reach 60+.

use std::sync::LazyLock;

use regex::Regex;

use crate::engine::ChatMessage;

static CODE_FENCE_OR_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```|(^|\s)(/|\./|~/)[\w./-]+|\b\w+\.(rs|py|ts|js|tsx|jsx|go|java|c|cpp|h|json|toml|yaml|yml|md|sh)\b")
        .unwrap_or_else(|e| panic!("code-fence regex: {e}"))
});

static CODEGEN_VERBS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(write|create|implement|refactor|fix|debug|edit|generate|build|patch)\b")
        .unwrap_or_else(|e| panic!("codegen regex: {e}"))
});

static ENUMERATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\d+[.)]\s|(?i)\bfirst\b.*\bthen\b")
        .unwrap_or_else(|e| panic!("enumeration regex: {e}"))
});

static ERROR_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\berror\b|\bstack trace\b|\btraceback\b|\bexception\b|\bpanic(ked)?\b|\bsegfault\b")
        .unwrap_or_else(|e| panic!("error regex: {e}"))
});

static TOOL_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bforge\b|\btool\b|\bscript\b|\bautomate\b")
        .unwrap_or_else(|e| panic!("tool regex: {e}"))
});

static DEEP_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdeep\b|\banaly[sz]e\b|\banalysis\b|\binvestigate\b|\bthorough(ly)?\b")
        .unwrap_or_else(|e| panic!("deep regex: {e}"))
});

const LENGTH_THRESHOLD_1: usize = 500;
const LENGTH_THRESHOLD_2: usize = 1_500;

/// Score a request 0–100.  Higher means heavier.
pub fn score(content: &str, prior: &[ChatMessage]) -> u8 {
    let mut score: u32 = 0;

    if CODE_FENCE_OR_PATH.is_match(content) {
        score += 15;
    }
    if CODEGEN_VERBS.is_match(content) {
        score += 25;
    }
    if ENUMERATION.is_match(content) {
        score += 10;
    }
    let len = content.chars().count();
    if len > LENGTH_THRESHOLD_1 {
        score += 10;
    }
    if len > LENGTH_THRESHOLD_2 {
        score += 10;
    }
    if ERROR_MARKERS.is_match(content) {
        score += 20;
    }
    if TOOL_MARKERS.is_match(content) {
        score += 15;
    }
    if DEEP_MARKERS.is_match(content) {
        score += 20;
    }

    // A conversation already mired in errors biases the next turn upward.
    let recent_tail: String = prior
        .iter()
        .rev()
        .take(3)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if ERROR_MARKERS.is_match(&recent_tail) {
        score += 10;
    }

    score.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_chat_is_below_forty() {
        assert!(score("hi", &[]) < 40);
        assert!(score("thanks, that worked!", &[]) < 40);
        assert!(score("what's the weather like?", &[]) < 40);
    }

    #[test]
    fn code_edit_tasks_land_in_the_middle_band() {
        let s = score("fix this function:\n```rust\nfn broken() {}\n```", &[]);
        assert!((40..60).contains(&s), "got {s}");

        let s = score("edit src/main.rs to add a flag", &[]);
        assert!((40..60).contains(&s), "got {s}");
    }

    #[test]
    fn crash_triage_reaches_sixty() {
        let trace = format!(
            "analyse this stack trace:\n{}",
            "at frame::step (interp.rs:42)\n".repeat(80)
        );
        assert!(trace.chars().count() >= 2_000);
        assert!(score(&trace, &[]) >= 60, "got {}", score(&trace, &[]));
    }

    #[test]
    fn score_saturates_at_hundred() {
        let monster = format!(
            "deep analyse and fix this error in src/main.rs with a script, first x then y:\n```\n{}\n```",
            "stack trace line\n".repeat(200)
        );
        assert!(score(&monster, &[]) <= 100);
    }

    #[test]
    fn error_laden_history_biases_upward() {
        let clean = score("try again please", &[]);
        let prior = vec![ChatMessage::assistant("Error: connection refused")];
        let biased = score("try again please", &prior);
        assert!(biased > clean);
    }

    #[test]
    fn deterministic() {
        let text = "implement a parser for config files";
        assert_eq!(score(text, &[]), score(text, &[]));
    }
}
