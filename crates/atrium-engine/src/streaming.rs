//! Ownership and cancellation of live response streams.
//!
//! The instance producing a stream holds a local cancellation token and a
//! marker in the shared store (`{prefix}:stream:{user}:{tenant}:{thread}`)
//! naming the stream id. A stop request handled by another instance cannot
//! reach the token, so it writes a short-lived stop key holding that id;
//! the owner picks it up at the next chunk boundary.

use std::sync::Arc;
use std::time::Duration;

use atrium_core::{StreamId, TenantKey, ThreadId};
use atrium_store::{namespace, StateStore};
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(120);
const DEFAULT_STOP_TTL: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Result of a stop request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The stream was owned here and has been cancelled.
    Local,
    /// Another instance owns the stream; a stop signal was left for it.
    Signalled,
    NotStreaming,
}

struct ActiveStream {
    stream_id: StreamId,
    cancel: CancellationToken,
}

type StreamKey = (TenantKey, ThreadId);

pub struct StreamingController {
    store: Arc<dyn StateStore>,
    marker_ns: String,
    stop_ns: String,
    marker_ttl: Duration,
    stop_ttl: Duration,
    poll_interval: Duration,
    active: DashMap<StreamKey, ActiveStream>,
}

impl StreamingController {
    pub fn new(store: Arc<dyn StateStore>, prefix: &str) -> Self {
        Self {
            store,
            marker_ns: namespace(prefix, "stream"),
            stop_ns: namespace(prefix, "stop"),
            marker_ttl: DEFAULT_MARKER_TTL,
            stop_ttl: DEFAULT_STOP_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            active: DashMap::new(),
        }
    }

    pub fn with_stop_ttl(mut self, ttl: Duration) -> Self {
        self.stop_ttl = ttl;
        self
    }

    /// How often a stream checks the store for a remote stop, and how often
    /// `wait_until_clear` re-checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn marker_key(&self, tenant: &TenantKey, thread_id: &ThreadId) -> String {
        tenant.thread_key(&self.marker_ns, thread_id)
    }

    fn stop_key(&self, tenant: &TenantKey, thread_id: &ThreadId) -> String {
        tenant.thread_key(&self.stop_ns, thread_id)
    }

    /// Register a new stream on the thread. Any previous local stream for the
    /// thread is cancelled.
    pub async fn begin(self: &Arc<Self>, tenant: &TenantKey, thread_id: &ThreadId) -> StreamGuard {
        let stream_id = StreamId::new();
        let cancel = CancellationToken::new();
        let previous = self.active.insert(
            (tenant.clone(), thread_id.clone()),
            ActiveStream {
                stream_id: stream_id.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(prev) = previous {
            warn!(thread = %thread_id, previous = %prev.stream_id, "replacing live stream");
            prev.cancel.cancel();
        }

        let marker = self.marker_key(tenant, thread_id);
        if let Err(e) = self
            .store
            .set(&marker, stream_id.as_str().as_bytes().to_vec(), self.marker_ttl)
            .await
        {
            warn!(thread = %thread_id, error = %e, "stream marker not written");
        }
        debug!(thread = %thread_id, stream_id = %stream_id, "stream started");

        let now = Instant::now();
        StreamGuard {
            controller: Arc::clone(self),
            tenant: tenant.clone(),
            thread_id: thread_id.clone(),
            stream_id,
            cancel,
            last_poll: now,
            last_refresh: now,
            finished: false,
        }
    }

    /// Stop whatever is streaming on the thread, here or on another instance.
    pub async fn stop(&self, tenant: &TenantKey, thread_id: &ThreadId) -> StopOutcome {
        if let Some(stream) = self.active.get(&(tenant.clone(), thread_id.clone())) {
            stream.cancel.cancel();
            info!(thread = %thread_id, stream_id = %stream.stream_id, "stream stopped locally");
            return StopOutcome::Local;
        }

        let owner = match self.store.get(&self.marker_key(tenant, thread_id)).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(thread = %thread_id, error = %e, "stream marker unreadable");
                return StopOutcome::NotStreaming;
            }
        };
        let Some(stream_id) = owner else {
            return StopOutcome::NotStreaming;
        };

        match self.store.set(&self.stop_key(tenant, thread_id), stream_id, self.stop_ttl).await {
            Ok(()) => {
                info!(thread = %thread_id, "stop signalled to owning instance");
                StopOutcome::Signalled
            }
            Err(e) => {
                warn!(thread = %thread_id, error = %e, "stop signal not written");
                StopOutcome::NotStreaming
            }
        }
    }

    /// Whether this instance is streaming on the thread.
    pub fn is_streaming_locally(&self, tenant: &TenantKey, thread_id: &ThreadId) -> bool {
        self.active.contains_key(&(tenant.clone(), thread_id.clone()))
    }

    /// Whether any instance is streaming on the thread.
    pub async fn is_streaming(&self, tenant: &TenantKey, thread_id: &ThreadId) -> bool {
        if self.is_streaming_locally(tenant, thread_id) {
            return true;
        }
        match self.store.get(&self.marker_key(tenant, thread_id)).await {
            Ok(marker) => marker.is_some(),
            Err(e) => {
                warn!(thread = %thread_id, error = %e, "stream marker unreadable, assuming clear");
                false
            }
        }
    }

    /// Wait for the thread to stop streaming. Returns `false` on timeout.
    pub async fn wait_until_clear(&self, tenant: &TenantKey, thread_id: &ThreadId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_streaming(tenant, thread_id).await {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(thread = %thread_id, ?timeout, "stream did not clear in time");
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn release_local(&self, tenant: &TenantKey, thread_id: &ThreadId, stream_id: &StreamId) -> bool {
        self.active
            .remove_if(&(tenant.clone(), thread_id.clone()), |_, s| &s.stream_id == stream_id)
            .is_some()
    }

    async fn release_marker(&self, tenant: &TenantKey, thread_id: &ThreadId, stream_id: &StreamId) {
        let key = self.marker_key(tenant, thread_id);
        if let Err(e) = self.store.delete_if_owner(&key, stream_id.as_str().as_bytes()).await {
            warn!(thread = %thread_id, error = %e, "stream marker not cleared");
        }
    }
}

/// Handle held by the producer of one stream.
///
/// Call [`StreamGuard::finish`] when done. Dropping without finishing still
/// releases the registration; the store marker is then cleared in the
/// background.
pub struct StreamGuard {
    controller: Arc<StreamingController>,
    tenant: TenantKey,
    thread_id: ThreadId,
    stream_id: StreamId,
    cancel: CancellationToken,
    last_poll: Instant,
    last_refresh: Instant,
    finished: bool,
}

impl StreamGuard {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checked at chunk boundaries. Looks for a remote stop at most once per
    /// poll interval and keeps the store marker alive.
    pub async fn should_stop(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        let c = &self.controller;
        if self.last_poll.elapsed() < c.poll_interval {
            return false;
        }
        self.last_poll = Instant::now();

        let stop_key = c.stop_key(&self.tenant, &self.thread_id);
        match c.store.get(&stop_key).await {
            Ok(Some(target)) if target == self.stream_id.as_str().as_bytes() => {
                info!(thread = %self.thread_id, stream_id = %self.stream_id, "remote stop received");
                self.cancel.cancel();
                if let Err(e) = c.store.delete(&stop_key).await {
                    warn!(error = %e, "stop signal not cleared");
                }
                return true;
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "stop signal unreadable"),
        }

        if self.last_refresh.elapsed() >= c.marker_ttl / 2 {
            self.last_refresh = Instant::now();
            let marker = c.marker_key(&self.tenant, &self.thread_id);
            if let Err(e) = c
                .store
                .set(&marker, self.stream_id.as_str().as_bytes().to_vec(), c.marker_ttl)
                .await
            {
                warn!(error = %e, "stream marker not refreshed");
            }
        }
        false
    }

    pub async fn finish(mut self) {
        self.finished = true;
        let c = Arc::clone(&self.controller);
        let _ = c.release_local(&self.tenant, &self.thread_id, &self.stream_id);
        c.release_marker(&self.tenant, &self.thread_id, &self.stream_id).await;
        debug!(thread = %self.thread_id, stream_id = %self.stream_id, "stream finished");
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let c = Arc::clone(&self.controller);
        let _ = c.release_local(&self.tenant, &self.thread_id, &self.stream_id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tenant = self.tenant.clone();
        let thread_id = self.thread_id.clone();
        let stream_id = self.stream_id.clone();
        drop(handle.spawn(async move {
            c.release_marker(&tenant, &thread_id, &stream_id).await;
        }));
    }
}
