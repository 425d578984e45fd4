//! Trace sampling.
//!
//! A sampler is consulted exactly once per trace, when its entry span is
//! created; every downstream context carries the decision unchanged and
//! child processes never re-sample. Samplers are therefore keyed on the
//! trace identifier alone, so the decision is a pure function of the trace.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Sampler decides whether a trace should be recorded and reported.
pub type Sampler = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// always_sample returns a Sampler that records every trace.
///
/// This is the operational default. Be careful about using it in a
/// production application with significant traffic: a segment will be
/// reported for every request.
pub fn always_sample() -> Sampler {
    Arc::new(|_trace_id| true)
}

/// never_sample returns a Sampler that records no traces.
///
/// Spans are still created locally so instrumented code needs no
/// conditional logic; only the reporter is skipped.
pub fn never_sample() -> Sampler {
    Arc::new(|_trace_id| false)
}

/// probability_sampler returns a Sampler that records a given fraction of
/// traces, deterministically per trace id.
pub fn probability_sampler(mut fraction: f64) -> Sampler {
    if fraction.is_sign_negative() {
        fraction = 0.0;
    } else if fraction >= 1.0 {
        return always_sample();
    }

    let trace_id_upper_bound = (fraction * ((1u64 << 63) as f64)).floor() as u64;
    Arc::new(move |trace_id| {
        let mut hasher = DefaultHasher::new();
        trace_id.hash(&mut hasher);
        (hasher.finish() >> 1) < trace_id_upper_bound
    })
}
