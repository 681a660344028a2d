use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, ScheduledTask, TickOutcome};

/// Fires every configured task once per interval. Every instance runs one;
/// the distributed lock decides which instance actually starts the run.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    tasks: Vec<ScheduledTask>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, tasks: Vec<ScheduledTask>, interval: Duration) -> Self {
        Self {
            orchestrator,
            tasks,
            interval,
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.tick_once().await;
            }
        })
    }

    /// One pass over every task. Returns how many runs were started here.
    pub async fn tick_once(&self) -> usize {
        let mut started = 0;
        for task in &self.tasks {
            let resp = self.orchestrator.run_scheduled_task_tick(task.clone()).await;
            match (resp.data, resp.error) {
                (Some(TickOutcome::Started { run_id }), _) => {
                    info!(task = %task.name, run_id = %run_id, "scheduled run started");
                    started += 1;
                }
                (Some(_), _) => {}
                (None, Some(err)) => warn!(task = %task.name, code = %err.code, error = %err.message, "scheduled tick failed"),
                (None, None) => {}
            }
        }
        started
    }
}
