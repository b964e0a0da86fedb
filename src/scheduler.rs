// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use otto_bus::{payload, Event, EventBus, EventType};

/// One persisted interval schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub workflow_id: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub args: Value,
}

/// Publishes `schedule:trigger` events for persisted interval schedules.
///
/// Schedules live in `<agent_dir>/schedules.json` and survive restarts; the
/// engine maps each trigger to a `workflow:run:start`.
pub struct Scheduler {
    bus: EventBus,
    path: PathBuf,
    schedules: Vec<Schedule>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Scheduler {
    /// Load persisted schedules; a missing or unreadable file is an empty
    /// schedule set, never a startup failure.
    pub async fn restore(path: PathBuf, bus: EventBus) -> Self {
        let schedules = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<Vec<Schedule>>(&text) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring malformed schedules file");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read schedules file");
                Vec::new()
            }
        };
        Self {
            bus,
            path,
            schedules,
            tasks: Vec::new(),
        }
    }

    pub fn schedule_count(&self) -> usize {
        self.schedules.len()
    }

    /// Spawn one interval timer per schedule.
    pub fn start(&mut self) {
        for schedule in &self.schedules {
            let bus = self.bus.clone();
            let schedule = schedule.clone();
            debug!(id = %schedule.id, every = schedule.interval_secs, "schedule armed");
            self.tasks.push(tokio::spawn(async move {
                let period = std::time::Duration::from_secs(schedule.interval_secs.max(1));
                let mut ticker = tokio::time::interval(period);
                // The immediate first tick would fire every schedule at boot.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let _ = bus.publish(Event::new(
                        EventType::ScheduleTrigger,
                        serde_json::to_value(payload::ScheduleTrigger {
                            schedule_id: schedule.id.clone(),
                            workflow_id: schedule.workflow_id.clone(),
                            args: schedule.args.clone(),
                        })
                        .unwrap_or_default(),
                    ));
                }
            }));
        }
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Persist the schedule set, write-then-rename.
    pub async fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&self.schedules)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn missing_file_restores_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = Scheduler::restore(dir.path().join("schedules.json"), EventBus::new()).await;
        assert_eq!(s.schedule_count(), 0);
    }

    #[tokio::test]
    async fn persist_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        let mut s = Scheduler::restore(path.clone(), EventBus::new()).await;
        s.schedules.push(Schedule {
            id: "nightly".into(),
            workflow_id: "cleanup".into(),
            interval_secs: 3600,
            args: serde_json::json!({"mode": "full"}),
        });
        s.persist().await.unwrap();

        let restored = Scheduler::restore(path, EventBus::new()).await;
        assert_eq!(restored.schedule_count(), 1);
        assert_eq!(restored.schedules[0].workflow_id, "cleanup");
    }

    #[tokio::test]
    async fn armed_schedule_publishes_triggers() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&hits);
        bus.subscribe(
            Some(EventType::ScheduleTrigger),
            Arc::new(move |_| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    *sink.lock().unwrap() += 1;
                    Ok(())
                })
            }),
        );

        let dir = tempfile::tempdir().unwrap();
        let mut s = Scheduler::restore(dir.path().join("s.json"), bus.clone()).await;
        s.schedules.push(Schedule {
            id: "fast".into(),
            workflow_id: "demo".into(),
            interval_secs: 1,
            args: Value::Null,
        });
        s.start();

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        bus.drain(Duration::from_secs(1)).await;
        s.stop();
        assert!(*hits.lock().unwrap() >= 1);
    }

    #[tokio::test]
    async fn malformed_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        std::fs::write(&path, "not json at all").unwrap();
        let s = Scheduler::restore(path, EventBus::new()).await;
        assert_eq!(s.schedule_count(), 0);
    }
}
