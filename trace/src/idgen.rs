use std::fmt::Write as _;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use lazy_static::lazy_static;
use rand_core::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

/// IdGenerator produces trace and segment identifiers.
///
/// Identifiers must never repeat within a process and must collide across
/// processes only with negligible probability.
pub trait IdGenerator {
    /// new_id returns a fresh identifier.
    fn new_id(&self) -> String;
}

/// default_id_generator returns the process-wide shared generator.
pub fn default_id_generator() -> Arc<dyn IdGenerator + Send + Sync> {
    lazy_static! {
        static ref DEFAULT_ID_GENERATOR: Arc<dyn IdGenerator + Send + Sync> =
            Arc::new(DefaultIdGenerator::new());
    }
    Arc::clone(&DEFAULT_ID_GENERATOR)
}

/// DefaultIdGenerator packs a randomly seeded component, a unix timestamp
/// and a per-process counter into sixteen bytes, rendered as a UUID-like
/// hyphenated hex string.
pub struct DefaultIdGenerator {
    source: Mutex<Xoshiro256Plus>,
    sequence: AtomicU64,
}

impl DefaultIdGenerator {
    /// new creates a generator seeded from the wall clock and process id.
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        DefaultIdGenerator {
            source: Mutex::new(Xoshiro256Plus::seed_from_u64(
                nanos ^ u64::from(process::id()),
            )),
            sequence: AtomicU64::new(0),
        }
    }
}

impl Default for DefaultIdGenerator {
    fn default() -> Self {
        DefaultIdGenerator::new()
    }
}

impl IdGenerator for DefaultIdGenerator {
    fn new_id(&self) -> String {
        let random = {
            let mut source = self.source.lock().unwrap();
            source.next_u64()
        };
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        // 8 bytes entropy, 4 bytes timestamp, 4 bytes counter: the counter
        // guarantees in-process uniqueness, the entropy gives a collision
        // domain well past 2^64 across the fleet.
        let mut bytes = [0u8; 16];
        BigEndian::write_u64(&mut bytes[0..8], random);
        BigEndian::write_u32(&mut bytes[8..12], seconds as u32);
        BigEndian::write_u32(&mut bytes[12..16], sequence as u32);
        format_id(&bytes)
    }
}

fn format_id(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in bytes.iter().enumerate() {
        if i == 4 || i == 6 || i == 8 || i == 10 {
            out.push('-');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
