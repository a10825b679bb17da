//! Context window guard: token-budget pre-flight for every engine call.
//!
//! Token counts are a conservative approximation — about four characters per
//! token plus a fixed per-message overhead — so the guard errs toward
//! compacting early rather than overflowing the model.

pub mod compactor;

pub use compactor::{Compactor, Summarizer};

use crate::engine::ChatMessage;

/// Tokens held back for the model's reply.
pub const RESERVE_TOKENS: usize = 2_000;

/// Below this remainder the call is blocked outright.
const BLOCK_THRESHOLD: usize = 2_000;
/// Below this remainder the compactor is invoked before proceeding.
const COMPACT_THRESHOLD: usize = 3_000;
/// Below this remainder a warning is logged but the call proceeds.
const WARN_THRESHOLD: usize = 4_000;

/// Context window for models the table doesn't know.
pub const DEFAULT_MAX_TOKENS: usize = 128_000;

// ─── Estimation ──────────────────────────────────────────────────────────────

/// ~4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Message cost: content tokens plus 4 tokens of framing overhead.
pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    estimate_tokens(&message.content) + 4
}

/// Known model → context window table.  Matching is by substring so that
/// provider-prefixed ids (`"ollama/llama3.2"`) resolve too.
pub fn max_tokens_for_model(model: &str) -> usize {
    const TABLE: &[(&str, usize)] = &[
        ("claude", 200_000),
        ("gpt-4o", 128_000),
        ("gpt-4", 128_000),
        ("o3", 200_000),
        ("llama3.2", 128_000),
        ("llama3", 8_192),
        ("qwen2.5", 32_768),
        ("mistral", 32_768),
        ("phi-3", 4_096),
        ("gemma", 8_192),
    ];
    let lower = model.to_lowercase();
    TABLE
        .iter()
        .find(|(name, _)| lower.contains(name))
        .map(|(_, max)| *max)
        .unwrap_or(DEFAULT_MAX_TOKENS)
}

// ─── Guard ───────────────────────────────────────────────────────────────────

/// What the pre-flight decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    Proceed,
    /// Proceed, but the window is getting tight.
    Warn,
    /// Run the compactor, then re-evaluate once.
    Compact,
    /// Refuse the call; even a compacted prompt cannot fit.
    Block,
}

/// Result of one guard evaluation.
#[derive(Debug, Clone, Copy)]
pub struct GuardVerdict {
    pub action: GuardAction,
    pub used: usize,
    pub remaining: usize,
    pub max: usize,
}

/// Evaluate the token budget for a prospective engine call.
pub fn evaluate(system_prompt: &str, messages: &[ChatMessage], max: usize) -> GuardVerdict {
    let used = estimate_tokens(system_prompt)
        + messages.iter().map(estimate_message_tokens).sum::<usize>()
        + RESERVE_TOKENS;
    let remaining = max.saturating_sub(used);

    let action = if remaining < BLOCK_THRESHOLD {
        GuardAction::Block
    } else if remaining < COMPACT_THRESHOLD {
        GuardAction::Compact
    } else if remaining < WARN_THRESHOLD {
        GuardAction::Warn
    } else {
        GuardAction::Proceed
    };

    GuardVerdict {
        action,
        used,
        remaining,
        max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(count: usize, chars_each: usize) -> Vec<ChatMessage> {
        (0..count)
            .map(|_| ChatMessage::user("x".repeat(chars_each)))
            .collect()
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn known_models_resolve() {
        assert_eq!(max_tokens_for_model("claude-sonnet-4-5"), 200_000);
        assert_eq!(max_tokens_for_model("ollama/llama3.2"), 128_000);
        assert_eq!(max_tokens_for_model("phi-3-mini"), 4_096);
        assert_eq!(max_tokens_for_model("mystery-model"), DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn empty_prompt_proceeds() {
        let v = evaluate("", &[], 128_000);
        assert_eq!(v.action, GuardAction::Proceed);
        assert_eq!(v.used, RESERVE_TOKENS);
    }

    #[test]
    fn used_equals_max_blocks() {
        // system prompt alone eats the whole window: remaining = 0.
        let system = "s".repeat(4 * (4_096 - RESERVE_TOKENS));
        let v = evaluate(&system, &[], 4_096);
        assert_eq!(v.remaining, 0);
        assert_eq!(v.action, GuardAction::Block);
    }

    #[test]
    fn twenty_thousand_token_history_on_small_model_blocks_or_compacts() {
        // 200 turns × ~400 chars ≈ 20k tokens against a 4 096 window.
        let v = evaluate("", &msgs(200, 400), 4_096);
        assert_eq!(v.action, GuardAction::Block);
    }

    #[test]
    fn thresholds_order_proceed_warn_compact_block() {
        let max = 10_000;
        // remaining = max - RESERVE - tokens(messages)
        let at_remaining = |remaining: usize| {
            let budget_tokens = max - RESERVE_TOKENS - remaining;
            // one message of (budget_tokens - 4) * 4 chars
            let v = evaluate("", &msgs(1, (budget_tokens - 4) * 4), max);
            assert_eq!(v.remaining, remaining);
            v.action
        };
        assert_eq!(at_remaining(4_500), GuardAction::Proceed);
        assert_eq!(at_remaining(3_500), GuardAction::Warn);
        assert_eq!(at_remaining(2_500), GuardAction::Compact);
        assert_eq!(at_remaining(1_500), GuardAction::Block);
    }
}
