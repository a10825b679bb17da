//! Recursive conversation compaction.
//!
//! When the guard reports `Compact`, the oldest slice of the turn history is
//! replaced with a single summarised system message.  The summariser is
//! injected (typically the live engine); when it fails the original messages
//! are returned unchanged and the caller deals with the still-full window.

use async_trait::async_trait;

use crate::engine::ChatMessage;

use super::{RESERVE_TOKENS, estimate_message_tokens};

/// Marker prefix on the synthetic summary message.
pub const SUMMARY_PREFIX: &str = "[CONVERSATION HISTORY SUMMARY]";

const SUMMARY_INSTRUCTION: &str = "Summarise the following conversation excerpt. Preserve: \
decisions made, TODOs, open questions, constraints, tool results that affect state, and any \
file or path references. Be dense; omit pleasantries.";

/// Injected summarisation capability.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, String>;
}

/// Splits off and summarises the oldest turns when over budget.
pub struct Compactor;

impl Compactor {
    /// Fraction of the message list to summarise for the given pressure.
    ///
    /// `0` when under budget; `0.15` just over, rising linearly to `0.4` at
    /// twice the budget; past that, a further `+0.1` per extra budget-width,
    /// capped at `0.6`.
    pub fn chunk_ratio(used: usize, max: usize) -> f64 {
        if max == 0 || used <= max {
            return 0.0;
        }
        let over = used as f64 / max as f64;
        if over <= 2.0 {
            0.15 + (over - 1.0) * 0.25
        } else {
            (0.4 + (over - 2.0) * 0.1).min(0.6)
        }
    }

    /// Compact `messages` against a `max`-token window.
    ///
    /// Returns the (possibly unchanged) message list.  The caller re-runs the
    /// guard afterwards; compaction is attempted at most once per request.
    pub async fn compact(
        messages: Vec<ChatMessage>,
        max: usize,
        summarizer: &dyn Summarizer,
    ) -> Vec<ChatMessage> {
        let used = messages
            .iter()
            .map(estimate_message_tokens)
            .sum::<usize>()
            + RESERVE_TOKENS;
        let ratio = Self::chunk_ratio(used, max);
        if ratio == 0.0 || messages.len() < 2 {
            return messages;
        }

        let split = ((messages.len() as f64 * ratio).ceil() as usize)
            .clamp(1, messages.len() - 1);
        let (to_summarize, to_keep) = messages.split_at(split);

        let excerpt = to_summarize
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let summary = match summarizer
            .summarize(&format!("{SUMMARY_INSTRUCTION}\n\n{excerpt}"))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "compaction summariser failed; keeping history");
                return messages;
            }
        };

        tracing::info!(
            summarised = to_summarize.len(),
            kept = to_keep.len(),
            "compacted conversation history"
        );

        let mut out = Vec::with_capacity(to_keep.len() + 1);
        out.push(ChatMessage::system(format!("{SUMMARY_PREFIX} {summary}")));
        out.extend_from_slice(to_keep);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _text: &str) -> Result<String, String> {
            Ok("decisions: use postgres; TODO: fix migration".to_owned())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _text: &str) -> Result<String, String> {
            Err("model offline".to_owned())
        }
    }

    fn long_history(turns: usize) -> Vec<ChatMessage> {
        (0..turns)
            .map(|i| ChatMessage::user(format!("turn {i}: {}", "x".repeat(400))))
            .collect()
    }

    #[test]
    fn ratio_zero_under_budget() {
        assert_eq!(Compactor::chunk_ratio(1_000, 4_096), 0.0);
        assert_eq!(Compactor::chunk_ratio(4_096, 4_096), 0.0);
    }

    #[test]
    fn ratio_scales_linearly_to_double() {
        let just_over = Compactor::chunk_ratio(4_100, 4_096);
        assert!((0.15..0.16).contains(&just_over), "got {just_over}");
        let double = Compactor::chunk_ratio(8_192, 4_096);
        assert!((double - 0.4).abs() < 1e-9, "got {double}");
    }

    #[test]
    fn ratio_caps_beyond_double() {
        assert!(Compactor::chunk_ratio(40_960, 4_096) <= 0.6);
    }

    #[tokio::test]
    async fn compacts_oldest_into_summary_message() {
        // 200 turns × ~400 chars ≈ 20k tokens against a 4 096 window.
        let messages = long_history(200);
        let out = Compactor::compact(messages, 4_096, &FixedSummarizer).await;

        assert!(out.len() < 200);
        assert!(out[0].content.starts_with(SUMMARY_PREFIX));
        // The newest turn always survives.
        assert!(out.last().unwrap().content.starts_with("turn 199"));
    }

    #[tokio::test]
    async fn under_budget_is_untouched() {
        let messages = vec![ChatMessage::user("hi")];
        let out = Compactor::compact(messages.clone(), 128_000, &FixedSummarizer).await;
        assert_eq!(out.len(), messages.len());
    }

    #[tokio::test]
    async fn summariser_failure_returns_original() {
        let messages = long_history(50);
        let out = Compactor::compact(messages.clone(), 4_096, &FailingSummarizer).await;
        assert_eq!(out.len(), messages.len());
        assert_eq!(out[0].content, messages[0].content);
    }
}
