//! Anti-repeat circuit breakers for the tool loop.
//!
//! A fresh [`LoopDetector`] is created per request and fed every tool call.
//! Four detectors run over a bounded history of `(argsHash, resultHash)`
//! pairs:
//!
//! 1. *Global circuit breaker* — the last [`CRITICAL_THRESHOLD`] entries all
//!    match the new call's args hash → abort.
//! 2. *Known-poll no-progress* — polling tools (shell, browser, process
//!    control) repeating with identical results → warn, then abort.
//! 3. *Ping-pong* — strict A-B-A-B alternation → abort.
//! 4. *Generic repeat* — any other tool repeating identical args → warn,
//!    then abort.

use std::collections::VecDeque;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// History depth.
pub const HISTORY_CAP: usize = 30;
/// Consecutive identical calls that trip the global breaker.
pub const CRITICAL_THRESHOLD: usize = 8;
/// Identical poll calls (with identical results) that abort.
pub const POLL_ABORT_THRESHOLD: usize = 5;
/// Identical poll calls that warn.
pub const POLL_WARN_THRESHOLD: usize = 3;
/// Length of alternation that counts as ping-pong.
pub const PING_PONG_SPAN: usize = 5;
/// Identical non-poll calls that abort.
pub const GENERIC_ABORT_THRESHOLD: usize = 5;
/// Identical non-poll calls that warn.
pub const GENERIC_WARN_THRESHOLD: usize = 3;

/// Tools that legitimately poll and may repeat with changing results.
const KNOWN_POLL_TOOLS: &[&str] = &[
    "execute_shell_command",
    "browser_interact",
    "process_start",
    "process_status",
];

/// Hash of a tool call identity: name + canonicalised args.
pub fn hash_args(name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(args.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Hash of a tool result for progress detection.
pub fn hash_result(output: &str) -> String {
    hex::encode(&Sha256::digest(output.as_bytes())[..16])
}

/// Verdict for a prospective tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopVerdict {
    Proceed,
    /// Execute, but prefix the result with this warning for the engine.
    Warn(String),
    /// Refuse execution; inject this message as a failed tool-result.
    Abort(String),
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    args_hash: String,
    result_hash: Option<String>,
}

/// Per-request tool-call history with repeat detection.
pub struct LoopDetector {
    history: VecDeque<HistoryEntry>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    /// Judge a call *before* execution.  `args_hash` is from [`hash_args`].
    pub fn check(&self, tool_name: &str, args_hash: &str) -> LoopVerdict {
        let tail_run = self.tail_run_len(args_hash);

        // 1. Global circuit breaker — fires regardless of result progress.
        if tail_run >= CRITICAL_THRESHOLD {
            return LoopVerdict::Abort(format!(
                "Loop detected: '{tool_name}' was called {tail_run} times in a row with \
                 identical arguments. The call was refused; change strategy."
            ));
        }

        // 2. Ping-pong alternation.
        if self.is_ping_pong(args_hash) {
            return LoopVerdict::Abort(format!(
                "Loop detected: '{tool_name}' is alternating between two identical calls. \
                 The call was refused; change strategy."
            ));
        }

        let occurrences = tail_run + 1;
        if KNOWN_POLL_TOOLS.contains(&tool_name) {
            // 3. Poll tools may repeat while results change; identical
            //    results mean no progress.
            if self.tail_results_identical(tail_run) {
                if occurrences >= POLL_ABORT_THRESHOLD {
                    return LoopVerdict::Abort(format!(
                        "Loop detected: '{tool_name}' polled {occurrences} times with no \
                         change in output. The call was refused."
                    ));
                }
                if occurrences >= POLL_WARN_THRESHOLD {
                    return LoopVerdict::Warn(format!(
                        "'{tool_name}' has returned identical output {tail_run} times; \
                         consider a different approach."
                    ));
                }
            }
        } else {
            // 4. Generic repeat.
            if occurrences >= GENERIC_ABORT_THRESHOLD {
                return LoopVerdict::Abort(format!(
                    "Loop detected: '{tool_name}' repeated {occurrences} times with identical \
                     arguments. The call was refused."
                ));
            }
            if occurrences >= GENERIC_WARN_THRESHOLD {
                return LoopVerdict::Warn(format!(
                    "'{tool_name}' was already called {tail_run} times with these arguments."
                ));
            }
        }

        LoopVerdict::Proceed
    }

    /// Record a completed (or refused) call.
    pub fn record(&mut self, args_hash: String, result_hash: Option<String>) {
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            args_hash,
            result_hash,
        });
    }

    /// Consecutive tail entries matching `args_hash`.
    fn tail_run_len(&self, args_hash: &str) -> usize {
        self.history
            .iter()
            .rev()
            .take_while(|e| e.args_hash == args_hash)
            .count()
    }

    /// All result hashes in the current tail run are present and equal.
    fn tail_results_identical(&self, tail_run: usize) -> bool {
        if tail_run < 2 {
            return tail_run > 0;
        }
        let mut results = self
            .history
            .iter()
            .rev()
            .take(tail_run)
            .map(|e| e.result_hash.as_deref());
        let Some(first) = results.next().flatten() else {
            return false;
        };
        results.all(|r| r == Some(first))
    }

    /// The new call would extend an A-B-A-B alternation to
    /// [`PING_PONG_SPAN`] entries.
    fn is_ping_pong(&self, args_hash: &str) -> bool {
        if self.history.len() < PING_PONG_SPAN - 1 {
            return false;
        }
        let tail: Vec<&str> = self
            .history
            .iter()
            .rev()
            .take(PING_PONG_SPAN - 1)
            .map(|e| e.args_hash.as_str())
            .collect();
        // tail[0] is the most recent entry.
        let b = tail[0];
        if args_hash == b {
            return false;
        }
        for (i, entry) in tail.iter().enumerate() {
            let expected = if i % 2 == 0 { b } else { args_hash };
            if *entry != expected {
                return false;
            }
        }
        true
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}
