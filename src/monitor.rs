use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::Span;

/// Bounded history of per-second samples kept for rate display
pub const SAMPLE_WINDOW: usize = 300;

/// How often per-connection counters are flushed into the global monitor
pub const FLUSH_PERIOD: Duration = Duration::from_millis(1000);

/// Monotonic clock origin shared by all activity timestamps
fn clock_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

fn now_millis() -> u64 {
    clock_origin().elapsed().as_millis() as u64
}

/// One point of the rolling traffic history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Unix timestamp (seconds) at which the snapshot was taken
    pub at_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Process-wide traffic counters.
///
/// Totals only ever reflect flushed per-connection increments, so they are
/// eventually consistent with in-flight connections. All updates are atomic;
/// the sample window is the only locked structure and is touched once per
/// second by the sampler task.
#[derive(Debug, Default)]
pub struct GlobalMonitor {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    samples: Mutex<VecDeque<Sample>>,
}

impl GlobalMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fold a flushed per-connection delta into the global totals
    pub fn add(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Register a new inbound connection; the guard releases the active
    /// slot on drop.
    pub fn begin_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            monitor: Arc::clone(self),
            released: false,
        }
    }

    /// Append a snapshot of the current totals to the rolling window
    pub fn record_sample(&self) {
        let at_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let sample = Sample {
            at_secs,
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
        };
        let mut samples = match self.samples.lock() {
            Ok(guard) => guard,
            // A poisoned window only degrades rate display, never liveness
            Err(poisoned) => poisoned.into_inner(),
        };
        samples.push_back(sample);
        while samples.len() > SAMPLE_WINDOW {
            samples.pop_front();
        }
    }

    pub fn samples(&self) -> Vec<Sample> {
        match self.samples.lock() {
            Ok(guard) => guard.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        }
    }

    /// Plaintext snapshot served by the /metrics endpoint
    pub fn metrics_text(&self) -> String {
        format!(
            "# TYPE proxy_in_bytes_total counter\n\
             proxy_in_bytes_total {}\n\
             # TYPE proxy_out_bytes_total counter\n\
             proxy_out_bytes_total {}\n\
             # TYPE proxy_connections_total counter\n\
             proxy_connections_total {}\n\
             # TYPE proxy_active_connections gauge\n\
             proxy_active_connections {}\n",
            self.bytes_in(),
            self.bytes_out(),
            self.total_connections(),
            self.active_connections(),
        )
    }

    /// Spawn the once-per-second sampler feeding the rolling window
    pub fn spawn_sampler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                self.record_sample();
            }
        })
    }
}

/// RAII guard for the active-connection gauge
pub struct ConnectionGuard {
    monitor: Arc<GlobalMonitor>,
    released: bool,
}

impl ConnectionGuard {
    /// Release the active slot; safe to call more than once
    pub fn release(&mut self) {
        if !self.released {
            self.monitor
                .active_connections
                .fetch_sub(1, Ordering::Relaxed);
            self.released = true;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-connection byte counters, owned by exactly one session.
///
/// `flush` drains the pending counters into the global monitor and records
/// the cumulative totals on the connection span; it runs on a fixed period
/// and once more at close. `close` is idempotent.
#[derive(Debug)]
pub struct ConnMonitor {
    pending_in: AtomicU64,
    pending_out: AtomicU64,
    total_in: AtomicU64,
    total_out: AtomicU64,
    last_activity_ms: AtomicU64,
    closed: AtomicBool,
    global: Arc<GlobalMonitor>,
    span: Span,
}

impl ConnMonitor {
    pub fn new(global: Arc<GlobalMonitor>, span: Span) -> Arc<Self> {
        Arc::new(Self {
            pending_in: AtomicU64::new(0),
            pending_out: AtomicU64::new(0),
            total_in: AtomicU64::new(0),
            total_out: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(now_millis()),
            closed: AtomicBool::new(false),
            global,
            span,
        })
    }

    /// Count bytes received from the client
    pub fn add_in(&self, n: u64) {
        self.pending_in.fetch_add(n, Ordering::Relaxed);
        self.total_in.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    /// Count bytes sent to the client
    pub fn add_out(&self, n: u64) {
        self.pending_out.fetch_add(n, Ordering::Relaxed);
        self.total_out.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last byte moved in either direction
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_in.load(Ordering::Relaxed),
            self.total_out.load(Ordering::Relaxed),
        )
    }

    /// Drain pending counters into the global monitor and update the span
    pub fn flush(&self) {
        let bytes_in = self.pending_in.swap(0, Ordering::Relaxed);
        let bytes_out = self.pending_out.swap(0, Ordering::Relaxed);
        if bytes_in > 0 || bytes_out > 0 {
            self.global.add(bytes_in, bytes_out);
        }
        let (total_in, total_out) = self.totals();
        self.span.record("bytes_in", total_in);
        self.span.record("bytes_out", total_out);
    }

    /// Final flush at connection teardown; second and later calls are no-ops
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.flush();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn the periodic flush task for this connection; it exits once the
    /// connection is closed.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_PERIOD);
            interval.tick().await;
            loop {
                interval.tick().await;
                if monitor.is_closed() {
                    break;
                }
                monitor.flush();
            }
        })
    }
}
