//! Human-in-the-loop approval gate for destructive and intrusive tools.
//!
//! Lifecycle: `create` → `register` → (`resolve` | expiry).  A resolved or
//! expired record is kept for a [`RESOLUTION_GRACE`] window so late awaiters
//! still read the outcome, then dropped.  `allow-once` decisions are consumed
//! atomically: exactly one `consume_allow_once` call returns `true`.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

/// Default time a request waits for a human decision.
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 120_000;

/// How long a settled record remains readable.
pub const RESOLUTION_GRACE: Duration = Duration::from_secs(15);

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalReason {
    Destructive,
    Intrusive,
}

/// What a tool call is asking permission for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub description: String,
    pub reason: ApprovalReason,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub request: ApprovalRequest,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub requested_by_client_id: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// `None` after expiry, `Some` after an explicit decision.
    pub decision: Option<ApprovalDecision>,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Pending,
    /// `None` = expired, which callers treat exactly like a deny.
    Settled(Option<ApprovalDecision>),
}

struct Entry {
    record: ApprovalRecord,
    tx: watch::Sender<WaitState>,
    allow_once_consumed: bool,
}

// ─── ApprovalGate ─────────────────────────────────────────────────────────────

/// Registry of in-flight approval requests.
pub struct ApprovalGate {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    /// Tool names the owner has blanket-approved via `allow-always`.
    always_allowed: Mutex<HashSet<String>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            always_allowed: Mutex::new(HashSet::new()),
        }
    }

    /// Build a record.  `timeout_ms` of 0 produces an already-expired record.
    pub fn create(
        &self,
        request: ApprovalRequest,
        timeout_ms: u64,
        id_hint: Option<String>,
        requested_by_client_id: Option<String>,
    ) -> ApprovalRecord {
        let now = Utc::now();
        ApprovalRecord {
            id: id_hint.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            request,
            created_at: now,
            expires_at: now + chrono::Duration::milliseconds(timeout_ms as i64),
            requested_by_client_id,
            resolved_at: None,
            decision: None,
            resolved_by: None,
        }
    }

    /// Register a record and start its expiry timer.  Idempotent by id.
    pub fn register(&self, record: ApprovalRecord) {
        let id = record.id.clone();
        let timeout = (record.expires_at - record.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        {
            let mut entries = lock(&self.entries);
            if entries.contains_key(&id) {
                return;
            }
            let (tx, _) = watch::channel(WaitState::Pending);
            entries.insert(
                id.clone(),
                Entry {
                    record,
                    tx,
                    allow_once_consumed: false,
                },
            );
        }

        // Expiry timer: settles the record as expired if still pending.
        let entries = self.entries.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut map = lock(&entries);
                match map.get_mut(&id) {
                    Some(entry) if entry.record.resolved_at.is_none() => {
                        entry.record.resolved_at = Some(Utc::now());
                        entry.record.decision = None;
                        let _ = entry.tx.send(WaitState::Settled(None));
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                tracing::info!(approval_id = %id, "approval expired without a decision");
                Self::schedule_removal(entries, id);
            }
        });
    }

    /// Wait for the decision.  Returns immediately when the record already
    /// settled (within the grace window) and `None` for unknown ids.
    pub async fn await_decision(&self, id: &str) -> Option<ApprovalDecision> {
        let mut rx = {
            let entries = lock(&self.entries);
            let entry = entries.get(id)?;
            match *entry.tx.borrow() {
                WaitState::Settled(outcome) => return outcome,
                WaitState::Pending => entry.tx.subscribe(),
            }
        };

        loop {
            if rx.changed().await.is_err() {
                return None;
            }
            if let WaitState::Settled(outcome) = *rx.borrow() {
                return outcome;
            }
        }
    }

    /// Record a human decision.  Returns `false` for unknown or already
    /// settled ids.
    pub fn resolve(&self, id: &str, decision: ApprovalDecision, resolved_by: &str) -> bool {
        let resolved = {
            let mut entries = lock(&self.entries);
            match entries.get_mut(id) {
                Some(entry) if entry.record.resolved_at.is_none() => {
                    entry.record.resolved_at = Some(Utc::now());
                    entry.record.decision = Some(decision);
                    entry.record.resolved_by = Some(resolved_by.to_owned());
                    let _ = entry.tx.send(WaitState::Settled(Some(decision)));
                    if decision == ApprovalDecision::AllowAlways
                        && let Ok(mut always) = self.always_allowed.lock()
                    {
                        always.insert(entry.record.request.tool_name.clone());
                    }
                    true
                }
                _ => false,
            }
        };
        if resolved {
            Self::schedule_removal(self.entries.clone(), id.to_owned());
        }
        resolved
    }

    /// Consume an `allow-once` decision.  Returns `true` exactly once per
    /// record; replays and non-allow-once decisions return `false`.
    pub fn consume_allow_once(&self, id: &str) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get_mut(id) {
            Some(entry)
                if entry.record.decision == Some(ApprovalDecision::AllowOnce)
                    && !entry.allow_once_consumed =>
            {
                entry.allow_once_consumed = true;
                true
            }
            _ => false,
        }
    }

    /// The owner previously answered `allow-always` for this tool.
    pub fn is_always_allowed(&self, tool_name: &str) -> bool {
        self.always_allowed
            .lock()
            .map(|s| s.contains(tool_name))
            .unwrap_or(false)
    }

    /// Number of unresolved requests (for heartbeat snapshots).
    pub fn pending_count(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|e| e.record.resolved_at.is_none())
            .count()
    }

    /// Snapshot of a record, if still retained.
    pub fn get(&self, id: &str) -> Option<ApprovalRecord> {
        lock(&self.entries).get(id).map(|e| e.record.clone())
    }

    fn schedule_removal(entries: Arc<Mutex<HashMap<String, Entry>>>, id: String) {
        tokio::spawn(async move {
            tokio::time::sleep(RESOLUTION_GRACE).await;
            lock(&entries).remove(&id);
        });
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            tool_name: "execute_shell_command".to_owned(),
            description: "run `rm -rf /tmp/test`".to_owned(),
            reason: ApprovalReason::Destructive,
            args: json!({"command": "rm -rf /tmp/test"}),
        }
    }

    #[tokio::test]
    async fn resolve_then_await_returns_decision() {
        let gate = ApprovalGate::new();
        let record = gate.create(request(), 60_000, None, Some("client-1".to_owned()));
        let id = record.id.clone();
        gate.register(record);

        gate.resolve(&id, ApprovalDecision::AllowOnce, "client-2");
        // Late awaiter inside the grace window still reads the outcome.
        assert_eq!(
            gate.await_decision(&id).await,
            Some(ApprovalDecision::AllowOnce)
        );
    }

    #[tokio::test]
    async fn await_then_resolve_wakes_waiter() {
        let gate = Arc::new(ApprovalGate::new());
        let record = gate.create(request(), 60_000, None, None);
        let id = record.id.clone();
        gate.register(record);

        let waiter = {
            let gate = gate.clone();
            let id = id.clone();
            tokio::spawn(async move { gate.await_decision(&id).await })
        };
        tokio::task::yield_now().await;
        assert!(gate.resolve(&id, ApprovalDecision::Deny, "client-1"));
        assert_eq!(waiter.await.unwrap(), Some(ApprovalDecision::Deny));
    }

    #[tokio::test]
    async fn allow_once_consumed_exactly_once() {
        let gate = ApprovalGate::new();
        let record = gate.create(request(), 60_000, None, None);
        let id = record.id.clone();
        gate.register(record);
        gate.resolve(&id, ApprovalDecision::AllowOnce, "client-1");

        assert!(gate.consume_allow_once(&id));
        assert!(!gate.consume_allow_once(&id), "replay must be refused");
    }

    #[tokio::test]
    async fn deny_is_not_consumable() {
        let gate = ApprovalGate::new();
        let record = gate.create(request(), 60_000, None, None);
        let id = record.id.clone();
        gate.register(record);
        gate.resolve(&id, ApprovalDecision::Deny, "client-1");
        assert!(!gate.consume_allow_once(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_expires_immediately() {
        let gate = ApprovalGate::new();
        let record = gate.create(request(), 0, None, None);
        let id = record.id.clone();
        gate.register(record);

        assert_eq!(gate.await_decision(&id).await, None);
        assert!(!gate.consume_allow_once(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_settles_as_expired() {
        let gate = ApprovalGate::new();
        let record = gate.create(request(), 1_000, None, None);
        let id = record.id.clone();
        gate.register(record);
        assert_eq!(gate.pending_count(), 1);

        let outcome = gate.await_decision(&id).await;
        assert_eq!(outcome, None);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_resolve_is_rejected() {
        let gate = ApprovalGate::new();
        let record = gate.create(request(), 60_000, None, None);
        let id = record.id.clone();
        gate.register(record);
        assert!(gate.resolve(&id, ApprovalDecision::Deny, "a"));
        assert!(!gate.resolve(&id, ApprovalDecision::AllowOnce, "b"));
        assert_eq!(gate.await_decision(&id).await, Some(ApprovalDecision::Deny));
    }

    #[tokio::test]
    async fn register_is_idempotent_by_id() {
        let gate = ApprovalGate::new();
        let record = gate.create(request(), 60_000, Some("fixed-id".to_owned()), None);
        gate.register(record.clone());
        gate.resolve("fixed-id", ApprovalDecision::AllowOnce, "a");
        // Re-registering the same id must not reset the resolved state.
        gate.register(record);
        assert_eq!(
            gate.await_decision("fixed-id").await,
            Some(ApprovalDecision::AllowOnce)
        );
    }

    #[tokio::test]
    async fn allow_always_is_remembered() {
        let gate = ApprovalGate::new();
        let record = gate.create(request(), 60_000, None, None);
        let id = record.id.clone();
        gate.register(record);
        assert!(!gate.is_always_allowed("execute_shell_command"));
        gate.resolve(&id, ApprovalDecision::AllowAlways, "client-1");
        assert!(gate.is_always_allowed("execute_shell_command"));
    }

    #[tokio::test]
    async fn unknown_id_returns_none() {
        let gate = ApprovalGate::new();
        assert_eq!(gate.await_decision("ghost").await, None);
        assert!(!gate.resolve("ghost", ApprovalDecision::Deny, "x"));
        assert!(!gate.consume_allow_once("ghost"));
    }
}
