//! Heartbeat state machine: the canonical daemon state plus the 1 Hz
//! snapshot broadcast.
//!
//! Transitions are event-driven (the tick never changes state) and only the
//! edges below are legal:
//!
//! ```text
//! IDLE ⇄ THINKING ⇄ EXECUTING_TOOL ⇄ BLOCKED_WAITING_USER
//! ```
//!
//! An illegal transition is logged and ignored — a late tool completion must
//! not corrupt the observable state.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::gateway::{Broadcaster, ServerMessage};

// ─── DaemonState ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonState {
    Idle,
    Thinking,
    ExecutingTool,
    BlockedWaitingUser,
}

impl DaemonState {
    /// Is `self → to` a legal edge?
    pub fn can_transition_to(self, to: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, to),
            (Idle, Thinking)
                | (Thinking, ExecutingTool)
                | (ExecutingTool, BlockedWaitingUser)
                | (BlockedWaitingUser, ExecutingTool)
                | (ExecutingTool, Thinking)
                | (Thinking, Idle)
        )
    }
}

// ─── StateHandle ──────────────────────────────────────────────────────────────

/// Shared, watchable daemon state.  Cloneable; all clones observe the same
/// underlying value.
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<DaemonState>>,
}

impl StateHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DaemonState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> DaemonState {
        *self.tx.borrow()
    }

    /// Apply a transition.  Returns `false` (and logs) when the edge is not
    /// legal; same-state transitions are silently ignored.
    pub fn transition(&self, to: DaemonState) -> bool {
        let from = self.current();
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            tracing::warn!(?from, ?to, "illegal state transition ignored");
            return false;
        }
        let _ = self.tx.send(to);
        tracing::debug!(?from, ?to, "state transition");
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.tx.subscribe()
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ─── HeartbeatSnapshot ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSnapshot {
    pub state: DaemonState,
    pub tick: u64,
    pub uptime_ms: u64,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub awaiting_approval: usize,
    pub connected_clients: usize,
    pub pid: u32,
    pub port: u16,
}

/// Read-only count sources, injected so the heartbeat never holds references
/// into other subsystems.
#[derive(Clone)]
pub struct SnapshotSources {
    pub active_tasks: Arc<dyn Fn() -> usize + Send + Sync>,
    pub pending_tasks: Arc<dyn Fn() -> usize + Send + Sync>,
    pub awaiting_approval: Arc<dyn Fn() -> usize + Send + Sync>,
    pub connected_clients: Arc<dyn Fn() -> usize + Send + Sync>,
}

impl SnapshotSources {
    /// All-zero sources for tests.
    pub fn empty() -> Self {
        Self {
            active_tasks: Arc::new(|| 0),
            pending_tasks: Arc::new(|| 0),
            awaiting_approval: Arc::new(|| 0),
            connected_clients: Arc::new(|| 0),
        }
    }
}

// ─── Heartbeat loop ───────────────────────────────────────────────────────────

/// Broadcast a [`HeartbeatSnapshot`] every second until `shutdown` flips.
pub async fn run(
    state: StateHandle,
    sources: SnapshotSources,
    broadcaster: Arc<dyn Broadcaster>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tick += 1;
                let snapshot = HeartbeatSnapshot {
                    state: state.current(),
                    tick,
                    uptime_ms: started.elapsed().as_millis() as u64,
                    active_tasks: (sources.active_tasks)(),
                    pending_tasks: (sources.pending_tasks)(),
                    awaiting_approval: (sources.awaiting_approval)(),
                    connected_clients: (sources.connected_clients)(),
                    pid: std::process::id(),
                    port,
                };
                broadcaster.broadcast(ServerMessage::heartbeat(&snapshot));
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn initial_state_is_idle() {
        let state = StateHandle::new();
        assert_eq!(state.current(), DaemonState::Idle);
    }

    #[test]
    fn legal_request_lifecycle() {
        let state = StateHandle::new();
        assert!(state.transition(DaemonState::Thinking));
        assert!(state.transition(DaemonState::ExecutingTool));
        assert!(state.transition(DaemonState::BlockedWaitingUser));
        assert!(state.transition(DaemonState::ExecutingTool));
        assert!(state.transition(DaemonState::Thinking));
        assert!(state.transition(DaemonState::Idle));
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let state = StateHandle::new();
        // IDLE cannot jump straight to a tool.
        assert!(!state.transition(DaemonState::ExecutingTool));
        assert_eq!(state.current(), DaemonState::Idle);

        state.transition(DaemonState::Thinking);
        // THINKING cannot block on approval without a tool.
        assert!(!state.transition(DaemonState::BlockedWaitingUser));
        assert_eq!(state.current(), DaemonState::Thinking);
    }

    #[test]
    fn same_state_is_noop() {
        let state = StateHandle::new();
        assert!(state.transition(DaemonState::Idle));
        assert_eq!(state.current(), DaemonState::Idle);
    }

    #[test]
    fn state_serialises_screaming_snake() {
        let json = serde_json::to_string(&DaemonState::BlockedWaitingUser).unwrap();
        assert_eq!(json, "\"BLOCKED_WAITING_USER\"");
    }

    struct CapturingBroadcaster(Mutex<Vec<ServerMessage>>);

    impl Broadcaster for CapturingBroadcaster {
        fn broadcast(&self, msg: ServerMessage) {
            if let Ok(mut v) = self.0.lock() {
                v.push(msg);
            }
        }
        fn send_to(&self, _client_id: &str, _msg: ServerMessage) {}
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_broadcasts_every_second() {
        let broadcaster = Arc::new(CapturingBroadcaster(Mutex::new(Vec::new())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = StateHandle::new();

        let task = tokio::spawn(run(
            state,
            SnapshotSources::empty(),
            broadcaster.clone(),
            7777,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let sent = broadcaster.0.lock().unwrap();
        assert!(sent.len() >= 3, "expected ≥3 ticks, got {}", sent.len());
        assert!(sent.iter().all(|m| m.kind == "heartbeat"));
        let first: serde_json::Value = sent[0].payload.clone();
        assert_eq!(first["state"], "IDLE");
        assert_eq!(first["port"], 7777);
    }
}
