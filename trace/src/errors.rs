use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// Error returned by a caller-supplied carrier closure (extractor/injector).
pub type CarrierError = Box<dyn Error + Send + Sync>;

/// Error returned by a collector transport when delivery fails.
pub type TransportError = Box<dyn Error + Send + Sync>;

/// ConfigError describes an invalid tracer or reporter configuration,
/// detected at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The service name is empty.
    #[error("service name must not be empty")]
    EmptyServiceName,
    /// The sampling rate is outside the closed interval [0.0, 1.0].
    #[error("sampling rate {0} is outside [0.0, 1.0]")]
    InvalidSamplingRate(f64),
    /// Neither a reporter nor a collector transport was supplied.
    #[error("a reporter or collector transport must be supplied")]
    MissingReporter,
    /// The collector address is empty.
    #[error("collector address must not be empty")]
    EmptyCollectorAddress,
    /// The reporter queue or batch size is zero.
    #[error("reporter queue and batch sizes must be non-zero")]
    InvalidQueueSize,
    /// The reporter delivery thread could not be spawned.
    #[error("failed to spawn reporter delivery thread")]
    Spawn(#[from] std::io::Error),
}

/// SpanError describes a failure to create or operate on a span.
///
/// Instrumentation code receiving one of these can choose to proceed
/// without tracing; the instrumented request itself is unaffected.
#[derive(Debug, Error)]
pub enum SpanError {
    /// The span has already ended; it is immutable and owned by its segment.
    #[error("span has already ended")]
    AlreadyEnded,
    /// A trace id override was requested somewhere other than an entry span
    /// with no decoded inbound context.
    #[error("trace id override is only valid on an entry span with no inbound context")]
    InvalidTraceIdOverride,
    /// The caller-supplied extractor failed to read the inbound carrier.
    #[error("reading the inbound carrier failed")]
    Extract {
        /// The extractor's error.
        #[source]
        source: CarrierError,
    },
    /// The caller-supplied injector failed to write the outbound carrier.
    #[error("writing the outbound carrier failed")]
    Inject {
        /// The injector's error.
        #[source]
        source: CarrierError,
    },
}

/// ReporterError describes a failure of an explicit flush or close request.
///
/// Background delivery failures are never surfaced here; they are retried
/// and eventually dropped inside the reporter.
#[derive(Debug, Error)]
pub enum ReporterError {
    /// The reporter has been closed and accepts no further requests.
    #[error("reporter is closed")]
    Closed,
    /// The reporter queue was full and the request could not be submitted.
    #[error("reporter queue is full")]
    QueueFull,
    /// The reporter did not acknowledge the request within the deadline.
    #[error("reporter did not drain within {0:?}")]
    TimedOut(Duration),
}
