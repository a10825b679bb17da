//! Lane scheduler: per-session FIFO execution without cross-session blocking.
//!
//! A lane is a named FIFO of commands with a single-execution guarantee:
//! within one lane, commands run strictly serially in enqueue order; across
//! lanes, commands run concurrently.  System-originated work shares the
//! `"main"` lane; each client gets `"session:<clientId>"`.
//!
//! Submission is synchronous — [`LaneScheduler::submit_request`] places the
//! command on its lane before returning, so caller-side ordering is lane
//! ordering.  Completion is observed by awaiting the returned receiver (or
//! the convenience wrapper [`LaneScheduler::enqueue`]).

pub mod heavy;

pub use heavy::{HeavyRunner, HeavyTask, HeavyTaskQueue, HeavyTaskState, HeavyTaskType};

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};

use crate::tools::SenderRole;

/// Lane key derivation: system work shares one lane, every other sender is
/// serialised per client.
pub fn lane_for(client_id: &str, role: SenderRole) -> String {
    if role == SenderRole::System {
        "main".to_owned()
    } else {
        format!("session:{client_id}")
    }
}

/// Why an enqueue did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaneError {
    /// The same request id is already queued or running on this lane.
    #[error("request '{0}' is already active on its lane")]
    DuplicateRequest(String),
    /// The lane worker disappeared before the command completed.
    #[error("lane '{0}' aborted")]
    Aborted(String),
}

struct LaneJob {
    started: Arc<AtomicBool>,
    fut: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// The scheduler: a map of lane name → worker queue.
pub struct LaneScheduler {
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<LaneJob>>>,
    active_requests: Arc<Mutex<HashSet<String>>>,
}

impl LaneScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lanes: Mutex::new(HashMap::new()),
            active_requests: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Place `fut` on `lane` and return a receiver for its result.  The
    /// command is on the lane when this returns, so two `submit` calls from
    /// one task run in call order.
    ///
    /// `warn_after` triggers an advisory log if the command has not
    /// *started* by the deadline; it never cancels.
    pub fn submit<T, F>(
        &self,
        lane: &str,
        warn_after: Option<Duration>,
        fut: F,
    ) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.submit_inner(lane, warn_after, None, fut)
    }

    /// [`submit`] guarded by a request id: the same id cannot re-enter the
    /// scheduler while its prior invocation is queued or running on this
    /// lane.
    pub fn submit_request<T, F>(
        &self,
        lane: &str,
        request_id: &str,
        warn_after: Option<Duration>,
        fut: F,
    ) -> Result<oneshot::Receiver<T>, LaneError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let guard_key = format!("{lane}\u{1f}{request_id}");
        {
            let mut active = lock(&self.active_requests);
            if !active.insert(guard_key.clone()) {
                return Err(LaneError::DuplicateRequest(request_id.to_owned()));
            }
        }
        Ok(self.submit_inner(lane, warn_after, Some(guard_key), fut))
    }

    /// Submit and await completion.
    pub async fn enqueue<T, F>(
        &self,
        lane: &str,
        warn_after: Option<Duration>,
        fut: F,
    ) -> Result<T, LaneError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.submit(lane, warn_after, fut)
            .await
            .map_err(|_| LaneError::Aborted(lane.to_owned()))
    }

    /// Submit with a request-id guard and await completion.
    pub async fn enqueue_request<T, F>(
        &self,
        lane: &str,
        request_id: &str,
        warn_after: Option<Duration>,
        fut: F,
    ) -> Result<T, LaneError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.submit_request(lane, request_id, warn_after, fut)?
            .await
            .map_err(|_| LaneError::Aborted(lane.to_owned()))
    }

    /// Number of lanes with a live worker.
    pub fn lane_count(&self) -> usize {
        lock(&self.lanes).len()
    }

    fn submit_inner<T, F>(
        &self,
        lane: &str,
        warn_after: Option<Duration>,
        guard_key: Option<String>,
        fut: F,
    ) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<T>();
        let started = Arc::new(AtomicBool::new(false));
        let active = self.active_requests.clone();

        let job = LaneJob {
            started: started.clone(),
            fut: Box::pin(async move {
                let result = fut.await;
                if let Some(key) = guard_key {
                    lock(&active).remove(&key);
                }
                // Receiver may have been dropped (caller gone); fine.
                let _ = done_tx.send(result);
            }),
        };

        if let Some(deadline) = warn_after {
            let lane_name = lane.to_owned();
            let started = started.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if !started.load(Ordering::SeqCst) {
                    tracing::warn!(
                        lane = %lane_name,
                        waited_ms = deadline.as_millis() as u64,
                        "lane command still waiting to start"
                    );
                }
            });
        }

        if self.sender_for(lane).send(job).is_err() {
            tracing::warn!(%lane, "lane worker is gone; command dropped");
        }
        done_rx
    }

    fn sender_for(&self, lane: &str) -> mpsc::UnboundedSender<LaneJob> {
        let mut lanes = lock(&self.lanes);
        if let Some(tx) = lanes.get(lane) {
            return tx.clone();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
        let lane_name = lane.to_owned();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.started.store(true, Ordering::SeqCst);
                job.fut.await;
            }
            tracing::debug!(lane = %lane_name, "lane worker stopped");
        });
        lanes.insert(lane.to_owned(), tx.clone());
        tx
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
