//! A client-side distributed tracing core.
//!
//! Instrumented processes create spans for inbound calls, outbound calls
//! and in-process work; spans created within one process for one trace are
//! collected into a segment, and completed segments are handed to a
//! background reporter for delivery to a collector. Trace context crosses
//! process boundaries as a single text header, so any carrier that can
//! hold a string header can propagate a trace.
//!
//! # Quick start
//!
//! ```
//! use std::time::Duration;
//!
//! use io_context::Context;
//! use skytrace::{InMemoryTransport, SpanMode, SpanOptions, Tracer};
//!
//! let transport = InMemoryTransport::new();
//! let tracer = Tracer::builder()
//!     .with_service("checkout")
//!     .with_transport(transport.clone())
//!     .build()?;
//!
//! let ctx = Context::background().freeze();
//! let extractor =
//!     |_key: &str| -> Result<Option<String>, skytrace::CarrierError> { Ok(None) };
//! let (_ctx, mut span) = tracer.create_span(
//!     &ctx,
//!     SpanMode::Entry { extractor: &extractor },
//!     SpanOptions::new().with_operation_name("GET /cart"),
//! )?;
//! span.tag(skytrace::tags::HTTP_METHOD, "GET")?;
//! span.end()?;
//!
//! tracer.flush(Duration::from_secs(1))?;
//! assert_eq!(transport.segments().len(), 1);
//! tracer.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

mod errors;
mod idgen;
pub mod propagation;
mod reporter;
mod sampling;
mod segment;
mod trace;

pub use crate::errors::{
    CarrierError, ConfigError, ReporterError, SpanError, TransportError,
};
pub use crate::idgen::{default_id_generator, DefaultIdGenerator, IdGenerator};
pub use crate::reporter::{
    BatchReporter, CollectorTransport, InMemoryTransport, Reporter, ReporterConfig,
};
pub use crate::sampling::{always_sample, never_sample, probability_sampler, Sampler};
pub use crate::segment::{
    tags, LogEntry, Segment, SpanLayer, SpanObject, SpanType,
};
pub use crate::trace::{Span, SpanMode, SpanOptions, Tracer, TracerBuilder};
