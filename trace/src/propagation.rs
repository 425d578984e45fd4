//! Encoding and decoding of the trace context exchanged between processes.
//!
//! The context travels as a single header value of eight `-`-delimited
//! fields, in order:
//!
//! 1. version marker (`"1"`)
//! 2. trace id (base64 of UTF-8)
//! 3. parent segment id (base64)
//! 4. parent span index (decimal)
//! 5. parent service (base64)
//! 6. parent service instance (base64)
//! 7. target address (base64)
//! 8. sampling flag (`"0"` or `"1"`)
//!
//! Free-form fields are base64-encoded so any text is safe to transmit as
//! one header token; the standard alphabet contains no `-`, so the
//! delimiter is unambiguous.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

/// The well-known header key under which the trace context is propagated.
pub const PROPAGATION_HEADER: &str = "sw8";

const HEADER_VERSION: &str = "1";
const FIELD_COUNT: usize = 8;

/// TraceContext is the state that crosses process boundaries.
///
/// It is immutable once created: an override of the trace id must happen
/// before the context is encoded, never by rewriting serialized state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TraceContext {
    /// Identifier of the whole trace, stable across every hop.
    pub trace_id: String,
    /// Identifier of the segment that created this context.
    pub parent_segment_id: String,
    /// Index of the span within the parent segment that made the outbound
    /// call. Non-negative in any transmitted context.
    pub parent_span_index: i32,
    /// Service name of the parent process.
    pub parent_service: String,
    /// Service instance identifier of the parent process.
    pub parent_service_instance: String,
    /// Network address the parent dialed to reach this process.
    pub target_address: String,
    /// Sampling decision made at the trace's entry span, carried unchanged.
    pub sample: bool,
}

/// DecodeError describes a malformed inbound trace context.
///
/// Receivers recover by starting a fresh trace; a propagation failure must
/// never abort the request it rode in on.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The version marker is not one this codec understands.
    #[error("unsupported trace context version {0:?}")]
    UnsupportedVersion(String),
    /// The header does not have the expected number of fields.
    #[error("expected {expected} trace context fields, found {found}")]
    FieldCount {
        /// Number of fields the codec requires.
        expected: usize,
        /// Number of fields actually present.
        found: usize,
    },
    /// A free-form field is not valid base64.
    #[error("trace context field {field} is not valid base64")]
    Base64 {
        /// Name of the offending field.
        field: &'static str,
        /// The underlying base64 error.
        #[source]
        source: base64::DecodeError,
    },
    /// A free-form field decoded to bytes that are not UTF-8.
    #[error("trace context field {field} is not valid utf-8")]
    Utf8 {
        /// Name of the offending field.
        field: &'static str,
        /// The underlying conversion error.
        #[source]
        source: std::string::FromUtf8Error,
    },
    /// A numeric field is not a parseable decimal number.
    #[error("trace context field {field} is not a number")]
    Number {
        /// Name of the offending field.
        field: &'static str,
        /// The underlying parse error.
        #[source]
        source: std::num::ParseIntError,
    },
    /// The sampling flag is neither `"0"` nor `"1"`.
    #[error("trace context sampling flag {0:?} is neither \"0\" nor \"1\"")]
    SamplingFlag(String),
}

/// encode returns the header value representation of a TraceContext.
pub fn encode(ctx: &TraceContext) -> String {
    [
        HEADER_VERSION.to_string(),
        STANDARD.encode(&ctx.trace_id),
        STANDARD.encode(&ctx.parent_segment_id),
        ctx.parent_span_index.to_string(),
        STANDARD.encode(&ctx.parent_service),
        STANDARD.encode(&ctx.parent_service_instance),
        STANDARD.encode(&ctx.target_address),
        if ctx.sample { "1" } else { "0" }.to_string(),
    ]
    .join("-")
}

/// decode parses a header value back into a TraceContext.
///
/// Any malformed input yields a `DecodeError`; this function never panics.
pub fn decode(header: &str) -> Result<TraceContext, DecodeError> {
    let fields: Vec<&str> = header.split('-').collect();
    if fields.len() != FIELD_COUNT {
        return Err(DecodeError::FieldCount {
            expected: FIELD_COUNT,
            found: fields.len(),
        });
    }
    if fields[0] != HEADER_VERSION {
        return Err(DecodeError::UnsupportedVersion(fields[0].to_string()));
    }

    // The delimiter split strips any sign, so a parseable index is
    // non-negative; parsing as i32 keeps out-of-range values from
    // wrapping into bogus parent references.
    let parent_span_index = fields[3]
        .parse::<i32>()
        .map_err(|source| DecodeError::Number {
            field: "parent span index",
            source,
        })?;

    let sample = match fields[7] {
        "0" => false,
        "1" => true,
        other => return Err(DecodeError::SamplingFlag(other.to_string())),
    };

    Ok(TraceContext {
        trace_id: decode_text("trace id", fields[1])?,
        parent_segment_id: decode_text("parent segment id", fields[2])?,
        parent_span_index,
        parent_service: decode_text("parent service", fields[4])?,
        parent_service_instance: decode_text("parent service instance", fields[5])?,
        target_address: decode_text("target address", fields[6])?,
        sample,
    })
}

fn decode_text(field: &'static str, value: &str) -> Result<String, DecodeError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|source| DecodeError::Base64 { field, source })?;
    String::from_utf8(bytes).map_err(|source| DecodeError::Utf8 { field, source })
}
