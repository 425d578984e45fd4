//! Asynchronous delivery of finished segments to a collector.
//!
//! Application threads hand segments to a [`Reporter`] and are never
//! blocked on network I/O: the batch reporter places them in a bounded
//! queue and a dedicated background thread drains, batches and transmits
//! them. Tracing data is best effort; a slow or unreachable collector
//! costs dropped segments, never request latency.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{ConfigError, ReporterError, TransportError};
use crate::segment::Segment;

const MAX_BACKOFF: Duration = Duration::from_secs(3);

/// Reporter buffers finished segments and delivers them asynchronously.
pub trait Reporter: Send + Sync {
    /// enqueue submits a segment for delivery. It never blocks on I/O;
    /// when the buffer is full the newest segment is dropped and counted.
    fn enqueue(&self, segment: Segment);

    /// flush delivers everything currently buffered, waiting at most
    /// `timeout` for the acknowledgement.
    fn flush(&self, timeout: Duration) -> Result<(), ReporterError>;

    /// close stops accepting segments, drains the buffer within a bounded
    /// deadline and releases the transport. Runs at most once; later
    /// calls are no-ops.
    fn close(&self);
}

/// CollectorTransport delivers batches of segments to a collector.
///
/// This is the crate's network seam: implementations own the connection
/// to the collector endpoint and its wire schema. `send` may block; it is
/// only ever called from the reporter's background thread.
pub trait CollectorTransport: Send {
    /// send transmits one batch.
    fn send(&mut self, batch: &[Segment]) -> Result<(), TransportError>;

    /// close releases the connection. Called once, at shutdown.
    fn close(&mut self) {}
}

impl CollectorTransport for Box<dyn CollectorTransport> {
    fn send(&mut self, batch: &[Segment]) -> Result<(), TransportError> {
        (**self).send(batch)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// ReporterConfig controls the batch reporter's queue and delivery.
#[derive(Clone, Debug)]
pub struct ReporterConfig {
    /// Collector endpoint (host:port) the supplied transport talks to.
    pub collector_address: String,
    /// Maximum number of segments buffered before drop-newest applies.
    pub max_queue_size: usize,
    /// Maximum number of segments per transmitted batch.
    pub max_batch_size: usize,
    /// Delay between two consecutive exports of a partial batch.
    pub scheduled_delay: Duration,
    /// Deadline for an explicit flush acknowledgement.
    pub flush_timeout: Duration,
    /// Deadline for draining the buffer at close.
    pub shutdown_timeout: Duration,
    /// Delivery retries before a batch is dropped.
    pub max_retries: usize,
    /// First retry backoff; doubles per attempt, bounded.
    pub initial_backoff: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        ReporterConfig {
            collector_address: "127.0.0.1:11800".to_string(),
            max_queue_size: 2048,
            max_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl ReporterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.collector_address.is_empty() {
            return Err(ConfigError::EmptyCollectorAddress);
        }
        if self.max_queue_size == 0 || self.max_batch_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }
        Ok(())
    }
}

/// Messages exchanged between producers and the background thread.
enum ReporterMessage {
    Report(Segment),
    Flush(SyncSender<Result<(), ReporterError>>),
    Shutdown(SyncSender<Result<(), ReporterError>>),
}

/// BatchReporter is the standard [`Reporter`]: a bounded queue drained by
/// a dedicated background thread that batches segments and retries
/// delivery with bounded backoff.
pub struct BatchReporter {
    sender: SyncSender<ReporterMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    is_shutdown: AtomicBool,
    dropped: AtomicUsize,
    flush_timeout: Duration,
    shutdown_timeout: Duration,
}

impl BatchReporter {
    /// new spawns the delivery thread for the given transport.
    pub fn new<T>(transport: T, config: ReporterConfig) -> Result<BatchReporter, ConfigError>
    where
        T: CollectorTransport + 'static,
    {
        config.validate()?;
        let (sender, receiver) = sync_channel(config.max_queue_size);
        let flush_timeout = config.flush_timeout;
        let shutdown_timeout = config.shutdown_timeout;

        let handle = thread::Builder::new()
            .name("skytrace-reporter".to_string())
            .spawn(move || drain_loop(transport, receiver, config))?;

        Ok(BatchReporter {
            sender,
            handle: Mutex::new(Some(handle)),
            is_shutdown: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
            flush_timeout,
            shutdown_timeout,
        })
    }

    /// dropped_count returns how many segments were dropped because the
    /// queue was full or the reporter was closed.
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn count_drop(&self) {
        if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!(
                "reporter dropped a segment (queue full or reporter closed); \
                 further drops are counted silently"
            );
        }
    }
}

impl Reporter for BatchReporter {
    fn enqueue(&self, segment: Segment) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            self.count_drop();
            return;
        }
        if self
            .sender
            .try_send(ReporterMessage::Report(segment))
            .is_err()
        {
            self.count_drop();
        }
    }

    fn flush(&self, timeout: Duration) -> Result<(), ReporterError> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(ReporterError::Closed);
        }
        let (ack, done) = sync_channel(1);
        self.sender
            .try_send(ReporterMessage::Flush(ack))
            .map_err(|_| ReporterError::QueueFull)?;
        match done.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(ReporterError::TimedOut(timeout)),
        }
    }

    fn close(&self) {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        let (ack, done) = sync_channel(1);
        match self.sender.try_send(ReporterMessage::Shutdown(ack)) {
            Ok(()) => {
                if done.recv_timeout(self.shutdown_timeout).is_err() {
                    warn!(
                        deadline = ?self.shutdown_timeout,
                        "reporter did not drain within the shutdown deadline"
                    );
                    return;
                }
                if let Some(handle) = self.handle.lock().unwrap().take() {
                    let _ = handle.join();
                }
            }
            Err(_) => {
                // Queue full at shutdown; the thread exits on disconnect
                // when the reporter is dropped.
                warn!("reporter queue full at shutdown, skipping drain");
            }
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(dropped, "segments were dropped over the reporter's lifetime");
        }
    }
}

fn drain_loop<T: CollectorTransport>(
    mut transport: T,
    receiver: Receiver<ReporterMessage>,
    config: ReporterConfig,
) {
    let mut batch: Vec<Segment> = Vec::new();
    let mut last_export = Instant::now();

    loop {
        let timeout = config.scheduled_delay.saturating_sub(last_export.elapsed());
        match receiver.recv_timeout(timeout) {
            Ok(ReporterMessage::Report(segment)) => {
                batch.push(segment);
                if batch.len() >= config.max_batch_size {
                    export(&mut transport, &mut batch, &config);
                    last_export = Instant::now();
                }
            }
            Ok(ReporterMessage::Flush(ack)) => {
                export(&mut transport, &mut batch, &config);
                last_export = Instant::now();
                let _ = ack.send(Ok(()));
            }
            Ok(ReporterMessage::Shutdown(ack)) => {
                export(&mut transport, &mut batch, &config);
                transport.close();
                let _ = ack.send(Ok(()));
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                export(&mut transport, &mut batch, &config);
                last_export = Instant::now();
            }
            Err(RecvTimeoutError::Disconnected) => {
                export(&mut transport, &mut batch, &config);
                transport.close();
                return;
            }
        }
    }
}

/// Transmits the batch, retrying with exponential backoff. A batch that
/// still fails after `max_retries` is dropped; reporting failures never
/// propagate to application code.
fn export<T: CollectorTransport>(
    transport: &mut T,
    batch: &mut Vec<Segment>,
    config: &ReporterConfig,
) {
    if batch.is_empty() {
        return;
    }
    let segments = batch.split_off(0);
    let mut backoff = config.initial_backoff;
    for attempt in 0..=config.max_retries {
        match transport.send(&segments) {
            Ok(()) => {
                debug!(segments = segments.len(), "delivered segment batch");
                return;
            }
            Err(err) => {
                if attempt == config.max_retries {
                    warn!(
                        error = %err,
                        dropped = segments.len(),
                        "dropping batch after repeated delivery failures"
                    );
                    return;
                }
                warn!(error = %err, attempt, "segment delivery failed, backing off");
                thread::sleep(backoff);
                backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
            }
        }
    }
}

/// InMemoryTransport keeps delivered segments in memory.
///
/// Useful in tests and examples: clones share the same storage, so a
/// clone kept by the test observes what the reporter delivered.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTransport {
    segments: Arc<Mutex<Vec<Segment>>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryTransport {
    /// new creates an empty transport.
    pub fn new() -> Self {
        InMemoryTransport::default()
    }

    /// segments returns a copy of everything delivered so far.
    pub fn segments(&self) -> Vec<Segment> {
        self.segments.lock().unwrap().clone()
    }

    /// is_closed reports whether the reporter released the transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl CollectorTransport for InMemoryTransport {
    fn send(&mut self, batch: &[Segment]) -> Result<(), TransportError> {
        self.segments.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
