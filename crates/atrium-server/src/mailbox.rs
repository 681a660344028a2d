//! Per-tenant ordered mailboxes on the shared runtime.
//!
//! Jobs for one tenant run one after another in submission order; different
//! tenants run in parallel. A tenant's worker exits after sitting idle and is
//! recreated by the next submission.

use std::sync::Arc;
use std::time::Duration;

use atrium_core::TenantKey;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, Instrument};

pub type Job = BoxFuture<'static, ()>;

pub struct TenantMailboxes {
    boxes: Arc<DashMap<TenantKey, mpsc::UnboundedSender<Job>>>,
    idle_timeout: Duration,
    tracker: TaskTracker,
}

impl TenantMailboxes {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            boxes: Arc::new(DashMap::new()),
            idle_timeout,
            tracker: TaskTracker::new(),
        }
    }

    /// Queue `job` behind everything already submitted for `tenant`.
    pub fn submit(&self, tenant: &TenantKey, job: Job) {
        let mut job = job;
        loop {
            let tx = self
                .boxes
                .entry(tenant.clone())
                .or_insert_with(|| self.spawn_worker(tenant.clone()))
                .clone();
            match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The worker retired between lookup and send.
                    job = returned;
                    self.boxes.remove_if(tenant, |_, current| current.same_channel(&tx));
                }
            }
        }
    }

    fn spawn_worker(&self, tenant: TenantKey) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let own = tx.clone();
        let boxes = Arc::clone(&self.boxes);
        let idle_timeout = self.idle_timeout;
        let span = tracing::info_span!("mailbox", tenant = %tenant);
        self.tracker.spawn(
            async move {
                loop {
                    match tokio::time::timeout(idle_timeout, rx.recv()).await {
                        Ok(Some(job)) => job.await,
                        Ok(None) => break,
                        Err(_) => {
                            boxes.remove_if(&tenant, |_, current| current.same_channel(&own));
                            rx.close();
                            while let Ok(job) = rx.try_recv() {
                                job.await;
                            }
                            debug!("idle mailbox retired");
                            break;
                        }
                    }
                }
            }
            .instrument(span),
        );
        tx
    }

    pub fn active_count(&self) -> usize {
        self.boxes.len()
    }

    /// Wait for every worker to retire. Used at shutdown and in tests.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn record(log: &Arc<Mutex<Vec<String>>>, entry: String, pause: Duration) -> Job {
        let log = Arc::clone(log);
        Box::pin(async move {
            tokio::time::sleep(pause).await;
            log.lock().push(entry);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn same_tenant_runs_in_order() {
        let mailboxes = TenantMailboxes::new(Duration::from_secs(5));
        let log = Arc::new(Mutex::new(Vec::new()));
        let tenant = TenantKey::new("alice", "acme");

        mailboxes.submit(&tenant, record(&log, "first".into(), Duration::from_millis(300)));
        mailboxes.submit(&tenant, record(&log, "second".into(), Duration::from_millis(10)));
        mailboxes.submit(&tenant, record(&log, "third".into(), Duration::ZERO));
        mailboxes.drain().await;

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn tenants_do_not_block_each_other() {
        let mailboxes = TenantMailboxes::new(Duration::from_secs(5));
        let log = Arc::new(Mutex::new(Vec::new()));

        mailboxes.submit(
            &TenantKey::new("alice", "acme"),
            record(&log, "slow".into(), Duration::from_secs(2)),
        );
        mailboxes.submit(
            &TenantKey::new("bob", "acme"),
            record(&log, "fast".into(), Duration::from_millis(1)),
        );
        assert_eq!(mailboxes.active_count(), 2);
        mailboxes.drain().await;

        assert_eq!(*log.lock(), vec!["fast", "slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_retires_and_comes_back() {
        let mailboxes = TenantMailboxes::new(Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        let tenant = TenantKey::new("alice", "acme");

        mailboxes.submit(&tenant, record(&log, "a".into(), Duration::ZERO));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mailboxes.active_count(), 0);

        mailboxes.submit(&tenant, record(&log, "b".into(), Duration::ZERO));
        mailboxes.drain().await;
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }
}
