//! Time-triggered synthetic prompts.
//!
//! Alert jobs live in `alerts.json` (persistence belongs to whoever writes
//! that file — the daemon only consumes it).  A background task wakes every
//! second, fires due jobs, and injects each as a synthetic `chat:request`
//! from `clientId = "scheduled-<jobId>"`, which the role policy downgrades
//! away from owner-only tools.

use std::{fs, path::Path, str::FromStr, sync::Mutex, time::Duration};

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::gateway::{ChatRequestPayload, ClientMessage, Inbound};

// ─── AlertJob ─────────────────────────────────────────────────────────────────

fn default_enabled() -> bool {
    true
}

/// One scheduled alert as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertJob {
    pub id: String,
    /// Cron expression with seconds (`"0 0 9 * * * *"` = daily at 09:00).
    pub schedule: String,
    /// Prompt injected verbatim as the synthetic request content.
    pub prompt: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

struct LoadedJob {
    job: AlertJob,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

pub struct Scheduler {
    jobs: Mutex<Vec<LoadedJob>>,
}

impl Scheduler {
    /// Load jobs from `alerts.json`.  A missing file means no jobs; a broken
    /// job is skipped with a warning rather than failing startup.
    pub fn load(alerts_path: &Path) -> Self {
        let raw_jobs: Vec<AlertJob> = match fs::read_to_string(alerts_path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "alerts.json unparseable; ignoring");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        let jobs = raw_jobs
            .into_iter()
            .filter(|j| j.enabled)
            .filter_map(|job| match Schedule::from_str(&job.schedule) {
                Ok(schedule) => {
                    let next = schedule.upcoming(Utc).next();
                    Some(LoadedJob {
                        job,
                        schedule,
                        next,
                    })
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "invalid cron expression; job skipped");
                    None
                }
            })
            .collect();

        Self {
            jobs: Mutex::new(jobs),
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    /// Scan once for due jobs, sending a synthetic request per fire.
    /// Returns the number fired.  Exposed for tests; [`run`] drives it.
    pub fn fire_due(&self, now: DateTime<Utc>, ingress: &mpsc::UnboundedSender<Inbound>) -> usize {
        let mut fired = 0;
        let Ok(mut jobs) = self.jobs.lock() else {
            return 0;
        };
        for loaded in jobs.iter_mut() {
            let Some(next) = loaded.next else { continue };
            if next > now {
                continue;
            }
            fired += 1;
            tracing::info!(job_id = %loaded.job.id, "scheduled job fired");
            let inbound = Inbound {
                client_id: format!("scheduled-{}", loaded.job.id),
                message: ClientMessage::ChatRequest(ChatRequestPayload {
                    content: loaded.job.prompt.clone(),
                    request_id: None,
                    prior_messages: None,
                    force_engine_hint: None,
                }),
            };
            if ingress.send(inbound).is_err() {
                tracing::warn!("ingress closed; scheduler stopping fires");
                break;
            }
            loaded.next = loaded.schedule.after(&now).next();
        }
        fired
    }

    /// Drive the per-second scan until shutdown.
    pub async fn run(
        self,
        ingress: mpsc::UnboundedSender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.fire_due(Utc::now(), &ingress);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_alerts(dir: &TempDir, json: &str) -> std::path::PathBuf {
        let path = dir.path().join("alerts.json");
        fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn missing_file_means_no_jobs() {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::load(&dir.path().join("alerts.json"));
        assert_eq!(scheduler.job_count(), 0);
    }

    #[test]
    fn invalid_cron_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_alerts(
            &dir,
            r#"[
                { "id": "ok", "schedule": "* * * * * * *", "prompt": "tick" },
                { "id": "broken", "schedule": "not cron", "prompt": "boom" }
            ]"#,
        );
        let scheduler = Scheduler::load(&path);
        assert_eq!(scheduler.job_count(), 1);
    }

    #[test]
    fn disabled_jobs_are_not_loaded() {
        let dir = TempDir::new().unwrap();
        let path = write_alerts(
            &dir,
            r#"[{ "id": "off", "schedule": "* * * * * * *", "prompt": "no", "enabled": false }]"#,
        );
        assert_eq!(Scheduler::load(&path).job_count(), 0);
    }

    #[tokio::test]
    async fn due_job_fires_synthetic_scheduled_request() {
        let dir = TempDir::new().unwrap();
        let path = write_alerts(
            &dir,
            r#"[{ "id": "morning", "schedule": "* * * * * * *", "prompt": "summarise inbox" }]"#,
        );
        let scheduler = Scheduler::load(&path);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // An every-second schedule is due within the next two seconds.
        let fired = scheduler.fire_due(Utc::now() + chrono::Duration::seconds(2), &tx);
        assert_eq!(fired, 1);

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.client_id, "scheduled-morning");
        match inbound.message {
            ClientMessage::ChatRequest(p) => assert_eq!(p.content, "summarise inbox"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn future_job_does_not_fire_early() {
        let dir = TempDir::new().unwrap();
        // Fires only in year 2099.
        let path = write_alerts(
            &dir,
            r#"[{ "id": "later", "schedule": "0 0 0 1 1 * 2099", "prompt": "happy 2099" }]"#,
        );
        let scheduler = Scheduler::load(&path);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(scheduler.fire_due(Utc::now(), &tx), 0);
    }

    #[tokio::test]
    async fn job_reschedules_after_firing() {
        let dir = TempDir::new().unwrap();
        let path = write_alerts(
            &dir,
            r#"[{ "id": "tick", "schedule": "* * * * * * *", "prompt": "t" }]"#,
        );
        let scheduler = Scheduler::load(&path);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let t1 = Utc::now() + chrono::Duration::seconds(2);
        assert_eq!(scheduler.fire_due(t1, &tx), 1);
        // Same instant again: the job has been rescheduled past t1.
        assert_eq!(scheduler.fire_due(t1, &tx), 0);
        // A later instant fires it again.
        let t2 = t1 + chrono::Duration::seconds(2);
        assert_eq!(scheduler.fire_due(t2, &tx), 1);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }
}
