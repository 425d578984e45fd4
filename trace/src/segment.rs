use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::propagation::TraceContext;

/// SpanType is the role a span plays within its segment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SpanType {
    /// Root unit of work for an inbound call.
    Entry,
    /// An outbound call whose context is injected into a carrier.
    Exit,
    /// In-process work with no cross-process context exchange.
    Local,
}

/// SpanLayer classifies the instrumented technology.
///
/// The integer codes match the collector's agent protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SpanLayer {
    /// Unknown layer. Could be anything.
    Unknown = 0,
    /// A database client.
    Database = 1,
    /// Either side of an RPC framework.
    RpcFramework = 2,
    /// HTTP, a more specific RPC framework.
    Http = 3,
    /// Either side of a message queue.
    MessageQueue = 4,
    /// A cache client.
    Cache = 5,
    /// A function-as-a-service platform.
    Faas = 6,
}

impl Default for SpanLayer {
    fn default() -> SpanLayer {
        SpanLayer::Unknown
    }
}

impl SpanLayer {
    /// code returns the wire-protocol integer for this layer.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Well-known tag keys understood by the collector.
///
/// Any key may be stored; these carry particular meaning downstream.
pub mod tags {
    /// URL of the request.
    pub const URL: &str = "url";
    /// Response status code.
    pub const STATUS_CODE: &str = "status_code";
    /// HTTP method of the request.
    pub const HTTP_METHOD: &str = "http.method";
    /// Database type, e.g. sql or redis.
    pub const DB_TYPE: &str = "db.type";
    /// Database instance name.
    pub const DB_INSTANCE: &str = "db.instance";
    /// Database statement executed.
    pub const DB_STATEMENT: &str = "db.statement";
    /// Parameters bound to the database statement.
    pub const DB_SQL_PARAMETERS: &str = "db.sql.parameters";
    /// Message queue name.
    pub const MQ_QUEUE: &str = "mq.queue";
    /// Message queue broker address.
    pub const MQ_BROKER: &str = "mq.broker";
    /// Message queue topic.
    pub const MQ_TOPIC: &str = "mq.topic";
}

/// LogEntry is one timestamped log record attached to a span.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    /// Wall-clock time of the log, unix milliseconds.
    pub timestamp: u64,
    /// Ordered key/value pairs.
    pub fields: Vec<(String, String)>,
}

/// SpanObject is the recorded data of one span.
///
/// It is mutated only through its owning handle while the span is active
/// and becomes immutable the instant the span ends, at which point the
/// segment takes exclusive ownership.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanObject {
    /// Sequential creation index within the segment; 0 is the root.
    pub index: i32,
    /// Index of the parent span, or -1 for the segment root.
    pub parent_index: i32,
    /// Role of the span.
    pub span_type: SpanType,
    /// Technology layer of the instrumented work.
    pub layer: SpanLayer,
    /// Integer code naming the instrumented library.
    pub component: i32,
    /// Operation name (endpoint).
    pub operation_name: String,
    /// Remote address for exit spans, empty otherwise.
    pub peer: String,
    /// Start wall-clock time, unix milliseconds.
    pub start_time: u64,
    /// End wall-clock time, unix milliseconds; 0 while active.
    pub end_time: u64,
    /// Tag name to value; keys unique, last write wins.
    pub tags: HashMap<String, String>,
    /// Ordered log entries.
    pub logs: Vec<LogEntry>,
    /// Whether the span recorded an error.
    pub is_error: bool,
}

/// Segment is the reportable collection of spans created within one
/// process for one trace. Immutable once reportable.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    /// Identifier of the trace this segment belongs to.
    pub trace_id: String,
    /// Identifier of this segment.
    pub segment_id: String,
    /// Service name of the producing process.
    pub service: String,
    /// Service instance identifier of the producing process.
    pub service_instance: String,
    /// Decoded inbound context, when the root is an entry span with a
    /// remote parent.
    pub parent: Option<TraceContext>,
    /// Spans in creation order; every parent index refers to an earlier
    /// span in this list.
    pub spans: Vec<SpanObject>,
}

/// Mutable per-segment bookkeeping shared by the span handles of one
/// logical execution.
pub(crate) struct SegmentState {
    pub(crate) trace_id: String,
    pub(crate) segment_id: String,
    pub(crate) sampled: bool,
    parent: Option<TraceContext>,
    finished: Vec<SpanObject>,
    next_index: i32,
    reported: bool,
}

impl SegmentState {
    pub(crate) fn new(
        trace_id: String,
        segment_id: String,
        sampled: bool,
        parent: Option<TraceContext>,
    ) -> Self {
        SegmentState {
            trace_id,
            segment_id,
            sampled,
            parent,
            finished: Vec::new(),
            next_index: 0,
            reported: false,
        }
    }

    /// Allocates the next creation index.
    pub(crate) fn alloc_index(&mut self) -> i32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Attaches an ended span. Returns false if the segment was already
    /// reported; late spans are discarded.
    pub(crate) fn attach(&mut self, span: SpanObject) -> bool {
        if self.reported {
            return false;
        }
        self.finished.push(span);
        true
    }

    /// Builds the immutable reportable segment and marks this state as
    /// reported so nothing can be attached afterwards.
    pub(crate) fn build(&mut self, service: &str, service_instance: &str) -> Segment {
        self.reported = true;
        let mut spans = std::mem::take(&mut self.finished);
        spans.sort_by_key(|s| s.index);
        Segment {
            trace_id: self.trace_id.clone(),
            segment_id: self.segment_id.clone(),
            service: service.to_string(),
            service_instance: service_instance.to_string(),
            parent: self.parent.take(),
            spans,
        }
    }
}

/// now_millis returns the wall clock as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
