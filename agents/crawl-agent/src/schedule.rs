//! Scheduled tasks
//!
//! The server can configure recurring tasks with `scheduled_task_config`. Each
//! enabled task gets its own timer that feeds [`AgentEvent::ScheduleDue`] into
//! the agent loop; the agent decides on every fire whether the task actually
//! runs.

use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agent::events::AgentEvent;
use crate::connection::protocol::ScheduledTaskSpec;

/// Timer period for a configured interval: whole minutes, at least one
pub fn period(interval_ms: u64) -> Duration {
    let minutes = ((interval_ms as f64) / 60_000.0).round().max(1.0) as u64;
    Duration::from_secs(minutes * 60)
}

struct ScheduledTask {
    spec: ScheduledTaskSpec,
    domain: Regex,
    timer: JoinHandle<()>,
}

pub struct Scheduler {
    tasks: HashMap<String, ScheduledTask>,
    events: mpsc::Sender<AgentEvent>,
}

impl Scheduler {
    pub fn new(events: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            tasks: HashMap::new(),
            events,
        }
    }

    /// Cancel every existing timer and start one per enabled task
    pub fn replace(&mut self, specs: Vec<ScheduledTaskSpec>) {
        self.clear();

        for spec in specs {
            if !spec.enabled {
                debug!(task_key = %spec.task_key, "Scheduled task disabled");
                continue;
            }

            let domain = match Regex::new(&spec.domain) {
                Ok(domain) => domain,
                Err(e) => {
                    warn!(task_key = %spec.task_key, domain = %spec.domain, error = %e, "Invalid domain pattern, task skipped");
                    continue;
                }
            };

            let every = period(spec.interval);
            let timer = self.start_timer(spec.task_key.clone(), every);
            info!(
                task_key = %spec.task_key,
                script_id = %spec.script_id,
                every_mins = every.as_secs() / 60,
                "Scheduled task armed"
            );

            if let Some(previous) = self.tasks.insert(
                spec.task_key.clone(),
                ScheduledTask { spec, domain, timer },
            ) {
                previous.timer.abort();
            }
        }
    }

    fn start_timer(&self, task_key: String, every: Duration) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + every, every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if events
                    .send(AgentEvent::ScheduleDue {
                        task_key: task_key.clone(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    pub fn get(&self, task_key: &str) -> Option<&ScheduledTaskSpec> {
        self.tasks.get(task_key).map(|t| &t.spec)
    }

    /// Whether the task's domain regex matches `hostname`
    pub fn matches_host(&self, task_key: &str, hostname: &str) -> bool {
        self.tasks
            .get(task_key)
            .map(|t| t.domain.is_match(hostname))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.timer.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(key: &str, interval: u64) -> ScheduledTaskSpec {
        ScheduledTaskSpec {
            task_key: key.to_string(),
            task_name: None,
            script_id: "s1".to_string(),
            domain: r"example\.com$".to_string(),
            interval,
            enabled: true,
            execute_on_idle: false,
        }
    }

    #[test]
    fn test_period_rounds_to_minutes() {
        assert_eq!(period(0), Duration::from_secs(60));
        assert_eq!(period(20_000), Duration::from_secs(60));
        assert_eq!(period(90_000), Duration::from_secs(120));
        assert_eq!(period(600_000), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_replace_skips_disabled_and_invalid() {
        let (tx, _rx) = mpsc::channel(4);
        let mut scheduler = Scheduler::new(tx);

        let mut disabled = spec("off", 60_000);
        disabled.enabled = false;
        let mut invalid = spec("bad", 60_000);
        invalid.domain = "(".to_string();

        scheduler.replace(vec![spec("a", 60_000), disabled, invalid]);
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.matches_host("a", "shop.example.com"));
        assert!(!scheduler.matches_host("a", "example.org"));
        assert!(!scheduler.matches_host("missing", "example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_replace_cancels() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = Scheduler::new(tx);
        scheduler.replace(vec![spec("a", 60_000)]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        match rx.recv().await {
            Some(AgentEvent::ScheduleDue { task_key }) => assert_eq!(task_key, "a"),
            other => panic!("unexpected event: {:?}", other),
        }

        scheduler.replace(Vec::new());
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(rx.try_recv().is_err());
        assert!(scheduler.is_empty());
    }
}
