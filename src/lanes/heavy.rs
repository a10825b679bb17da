//! Heavy task queue: a bounded worker pool for background work on the
//! worker engine.
//!
//! `enqueue` returns immediately with the task id; completion fires the
//! task's callback and a `worker_task_completed` / `worker_task_failed`
//! broadcast.  The queue is in-memory only: queued tasks are advisory (deep
//! analysis, memory distillation) and are simply lost on crash.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::gateway::{Broadcaster, ServerMessage};

/// Single scarce worker-engine resource by default.
pub const DEFAULT_CONCURRENCY: usize = 1;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeavyTaskType {
    DeepAnalysis,
    DistillMemory,
    #[serde(untagged)]
    Custom(String),
}

impl std::fmt::Display for HeavyTaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeepAnalysis => write!(f, "deep_analysis"),
            Self::DistillMemory => write!(f, "distill_memory"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeavyTaskState {
    Queued,
    Running,
    Done,
    Failed,
}

/// A unit of background work handed to the worker engine.
#[derive(Debug, Clone)]
pub struct HeavyTask {
    pub id: String,
    pub description: String,
    pub prompt: String,
    pub task_type: HeavyTaskType,
    pub enqueued_at: DateTime<Utc>,
}

/// Bookkeeping row surfaced in status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeavyTaskStatus {
    pub id: String,
    pub description: String,
    pub task_type: HeavyTaskType,
    pub state: HeavyTaskState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Executes one heavy task, typically by streaming the worker engine to
/// completion and returning the collected text.
#[async_trait]
pub trait HeavyRunner: Send + Sync {
    async fn run(&self, task: &HeavyTask) -> Result<String, String>;
}

/// Invoked on the daemon's runtime once the task settles.
pub type HeavyCallback = Box<dyn FnOnce(Result<String, String>) + Send>;

struct QueuedTask {
    task: HeavyTask,
    on_complete: Option<HeavyCallback>,
}

// ─── HeavyTaskQueue ───────────────────────────────────────────────────────────

pub struct HeavyTaskQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    statuses: Arc<Mutex<HashMap<String, HeavyTaskStatus>>>,
}

impl HeavyTaskQueue {
    /// Start the worker pool.
    pub fn new(
        concurrency: usize,
        runner: Arc<dyn HeavyRunner>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<QueuedTask>();
        let queued = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let statuses = Arc::new(Mutex::new(HashMap::new()));

        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker_idx in 0..concurrency.max(1) {
            let rx = shared_rx.clone();
            let runner = runner.clone();
            let broadcaster = broadcaster.clone();
            let queued = queued.clone();
            let running = running.clone();
            let statuses = statuses.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(mut queued_task) = next else {
                        break;
                    };
                    queued.fetch_sub(1, Ordering::SeqCst);
                    running.fetch_add(1, Ordering::SeqCst);
                    let task = queued_task.task.clone();
                    set_status(&statuses, &task.id, HeavyTaskState::Running, |s| {
                        s.started_at = Some(Utc::now());
                    });
                    tracing::info!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        worker = worker_idx,
                        "heavy task started"
                    );

                    let result = runner.run(&task).await;
                    running.fetch_sub(1, Ordering::SeqCst);

                    match &result {
                        Ok(output) => {
                            set_status(&statuses, &task.id, HeavyTaskState::Done, |s| {
                                s.finished_at = Some(Utc::now());
                            });
                            broadcaster.broadcast(ServerMessage::worker_task_completed(
                                &task.id,
                                &task.task_type.to_string(),
                                &summary_of(output),
                            ));
                        }
                        Err(error) => {
                            set_status(&statuses, &task.id, HeavyTaskState::Failed, |s| {
                                s.finished_at = Some(Utc::now());
                            });
                            broadcaster.broadcast(ServerMessage::worker_task_failed(
                                &task.id,
                                &task.task_type.to_string(),
                                error,
                            ));
                        }
                    }

                    if let Some(callback) = queued_task.on_complete.take() {
                        callback(result);
                    }
                }
            });
        }

        Arc::new(Self {
            tx,
            queued,
            running,
            statuses,
        })
    }

    /// Enqueue a task; returns its id immediately.
    pub fn enqueue(
        &self,
        description: impl Into<String>,
        prompt: impl Into<String>,
        task_type: HeavyTaskType,
        on_complete: Option<HeavyCallback>,
    ) -> String {
        let task = HeavyTask {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            prompt: prompt.into(),
            task_type,
            enqueued_at: Utc::now(),
        };
        let id = task.id.clone();

        if let Ok(mut map) = self.statuses.lock() {
            map.insert(
                id.clone(),
                HeavyTaskStatus {
                    id: id.clone(),
                    description: task.description.clone(),
                    task_type: task.task_type.clone(),
                    state: HeavyTaskState::Queued,
                    enqueued_at: task.enqueued_at,
                    started_at: None,
                    finished_at: None,
                },
            );
        }
        self.queued.fetch_add(1, Ordering::SeqCst);

        if self
            .tx
            .send(QueuedTask {
                task,
                on_complete,
            })
            .is_err()
        {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("heavy queue workers are gone; task dropped");
        }
        id
    }

    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self, task_id: &str) -> Option<HeavyTaskStatus> {
        self.statuses
            .lock()
            .ok()
            .and_then(|m| m.get(task_id).cloned())
    }
}

fn set_status(
    statuses: &Mutex<HashMap<String, HeavyTaskStatus>>,
    id: &str,
    state: HeavyTaskState,
    mutate: impl FnOnce(&mut HeavyTaskStatus),
) {
    if let Ok(mut map) = statuses.lock()
        && let Some(status) = map.get_mut(id)
    {
        status.state = state;
        mutate(status);
    }
}

/// First 200 chars of a heavy result, for the completion broadcast.
fn summary_of(output: &str) -> String {
    output.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct EchoRunner;

    #[async_trait]
    impl HeavyRunner for EchoRunner {
        async fn run(&self, task: &HeavyTask) -> Result<String, String> {
            Ok(format!("analysis of: {}", task.prompt))
        }
    }

    struct FailRunner;

    #[async_trait]
    impl HeavyRunner for FailRunner {
        async fn run(&self, _task: &HeavyTask) -> Result<String, String> {
            Err("worker engine offline".to_owned())
        }
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

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn completion_fires_callback_and_broadcast() {
        let broadcaster = Arc::new(CapturingBroadcaster(Mutex::new(Vec::new())));
        let queue = HeavyTaskQueue::new(1, Arc::new(EchoRunner), broadcaster.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = queue.enqueue(
            "deep analysis",
            "the stack trace",
            HeavyTaskType::DeepAnalysis,
            Some(Box::new(move |result| {
                if let Some(tx) = tx.lock().ok().and_then(|mut g| g.take()) {
                    let _ = tx.send(result);
                }
            })),
        );

        let result = rx.await.unwrap().unwrap();
        assert!(result.contains("the stack trace"));

        wait_for(|| !broadcaster.0.lock().unwrap().is_empty()).await;
        let sent = broadcaster.0.lock().unwrap();
        assert_eq!(sent[0].kind, "worker_task_completed");
        assert_eq!(sent[0].payload["taskType"], "deep_analysis");
        assert_eq!(sent[0].payload["taskId"], id.as_str());
    }

    #[tokio::test]
    async fn failure_broadcasts_worker_task_failed() {
        let broadcaster = Arc::new(CapturingBroadcaster(Mutex::new(Vec::new())));
        let queue = HeavyTaskQueue::new(1, Arc::new(FailRunner), broadcaster.clone());

        let id = queue.enqueue("doomed", "prompt", HeavyTaskType::DistillMemory, None);
        wait_for(|| !broadcaster.0.lock().unwrap().is_empty()).await;

        let sent = broadcaster.0.lock().unwrap();
        assert_eq!(sent[0].kind, "worker_task_failed");
        assert_eq!(sent[0].payload["error"], "worker engine offline");
        drop(sent);

        wait_for(|| queue.status(&id).map(|s| s.state) == Some(HeavyTaskState::Failed)).await;
    }

    #[tokio::test]
    async fn counts_drain_to_zero() {
        let broadcaster = Arc::new(CapturingBroadcaster(Mutex::new(Vec::new())));
        let queue = HeavyTaskQueue::new(1, Arc::new(EchoRunner), broadcaster);
        for _ in 0..3 {
            queue.enqueue("task", "p", HeavyTaskType::DeepAnalysis, None);
        }
        wait_for(|| queue.queued_count() == 0 && queue.running_count() == 0).await;
    }

    #[tokio::test]
    async fn status_progresses_to_done() {
        let broadcaster = Arc::new(CapturingBroadcaster(Mutex::new(Vec::new())));
        let queue = HeavyTaskQueue::new(1, Arc::new(EchoRunner), broadcaster);
        let id = queue.enqueue("task", "p", HeavyTaskType::DeepAnalysis, None);
        wait_for(|| queue.status(&id).map(|s| s.state) == Some(HeavyTaskState::Done)).await;
        let status = queue.status(&id).unwrap();
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn task_type_serialisation() {
        assert_eq!(
            serde_json::to_string(&HeavyTaskType::DeepAnalysis).unwrap(),
            "\"deep_analysis\""
        );
        assert_eq!(
            serde_json::to_string(&HeavyTaskType::Custom("index_codebase".to_owned())).unwrap(),
            "\"index_codebase\""
        );
    }
}
