//! The running instruction-address histogram and its progress
//! reporting.
//!
//! The replay loop records every retired PC here. Consecutive
//! duplicates are suppressed: a message retirement that leaves the PC
//! in place (an unresolved branch being retried, say) must not count
//! the same instruction twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Retired instructions between intermediate progress callbacks.
pub const UPDATE_INTERVAL: u64 = 1_000_000;

/// Progress callback: `(histogram, bytes_processed, instructions_retired)`.
///
/// The map reference is a read-only view of live decoder state; the
/// callback runs on the decoder thread and must not re-enter the
/// profiler.
pub type HistogramCallback = Box<dyn FnMut(&HashMap<u64, u64>, u64, u64) + Send>;

/// Handle for requesting an out-of-band flush callback. Any thread may
/// set a byte offset; once the decoder has processed that many stream
/// bytes it fires the callback unconditionally. Used by file-backed
/// producers to learn when their final bytes have drained.
#[derive(Clone)]
pub struct FlushHandle {
    offset: Arc<AtomicU64>,
}

impl FlushHandle {
    pub fn request_flush_at(&self, byte_offset: u64) {
        self.offset.store(byte_offset, Ordering::Relaxed);
    }
}

pub(crate) struct Histogram {
    map: HashMap<u64, u64>,
    prev_address: Option<u64>,
    instructions: u64,
    next_report: u64,
    flush_offset: Arc<AtomicU64>,
    callback: Option<HistogramCallback>,
}

impl Histogram {
    pub fn new() -> Histogram {
        Histogram {
            map: HashMap::new(),
            prev_address: None,
            instructions: 0,
            next_report: UPDATE_INTERVAL,
            flush_offset: Arc::new(AtomicU64::new(u64::MAX)),
            callback: None,
        }
    }

    pub fn set_callback(&mut self, callback: HistogramCallback) {
        self.callback = Some(callback);
    }

    pub fn flush_handle(&self) -> FlushHandle {
        FlushHandle {
            offset: Arc::clone(&self.flush_offset),
        }
    }

    /// Tallies one retired PC, suppressing consecutive duplicates.
    pub fn record(&mut self, addr: u64) {
        if self.prev_address != Some(addr) {
            *self.map.entry(addr).or_insert(0) += 1;
            self.instructions += 1;
        }
        self.prev_address = Some(addr);
    }

    /// Cadence and flush checks, run once per message boundary.
    pub fn report_progress(&mut self, bytes_processed: u64) {
        if self.instructions > self.next_report {
            self.next_report += UPDATE_INTERVAL;
            self.invoke(bytes_processed);
        }

        if bytes_processed >= self.flush_offset.load(Ordering::Relaxed) {
            self.invoke(bytes_processed);
        }
    }

    /// Final callback at end of stream. Disarms the flush sentinel so
    /// repeated calls after `Done` stay quiet.
    pub fn finish(&mut self, bytes_processed: u64) {
        self.flush_offset.store(u64::MAX, Ordering::Relaxed);
        self.invoke(bytes_processed);
    }

    fn invoke(&mut self, bytes_processed: u64) {
        if let Some(callback) = self.callback.as_mut() {
            callback(&self.map, bytes_processed, self.instructions);
        }
    }

    pub fn map(&self) -> &HashMap<u64, u64> {
        &self.map
    }

    pub fn instructions_retired(&self) -> u64 {
        self.instructions
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
