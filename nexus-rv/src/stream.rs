//! The byte queue between the probe-side producer and the decoder.
//!
//! One producer thread pushes raw capture bytes while the decoder
//! thread drains them. Neither side ever blocks on the other: the
//! producer appends under a short-lived lock, and the decoder reports
//! "need more bytes" upstream when the queue runs dry. End-of-data is a
//! separate latch so a producer can finish while the decoder is still
//! draining.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Outcome of a single-byte fetch from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fetch {
    Byte(u8),
    /// Queue is dry but the producer has not finished; retry later.
    Empty,
    /// Queue is dry and the producer raised the end-of-data latch.
    EndOfData,
}

/// Errors from the producer-facing surface of the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// A push with no bytes in it; the capture layer handing us one of
    /// these has lost track of its buffers.
    #[error("pushed an empty buffer")]
    EmptyPush,
}

#[derive(Default)]
struct Shared {
    buffer: Mutex<VecDeque<u8>>,
    end_of_data: Mutex<bool>,
}

/// Cloneable handle to the trace byte queue. Hand one clone to the
/// producer and keep one inside the decoder.
#[derive(Clone, Default)]
pub struct TraceStream {
    shared: Arc<Shared>,
}

impl TraceStream {
    pub fn new() -> TraceStream {
        TraceStream::default()
    }

    /// Appends captured bytes in arrival order.
    pub fn push(&self, bytes: &[u8]) -> Result<(), StreamError> {
        if bytes.is_empty() {
            return Err(StreamError::EmptyPush);
        }

        let mut buffer = self.shared.buffer.lock().unwrap();
        buffer.extend(bytes.iter().copied());
        Ok(())
    }

    /// Signals that no further bytes will arrive. Bytes already queued
    /// are still drained before the decoder observes end-of-data.
    pub fn set_end_of_data(&self) {
        *self.shared.end_of_data.lock().unwrap() = true;
    }

    /// Number of bytes currently queued.
    pub fn len(&self) -> usize {
        self.shared.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The end-of-data latch is read before the buffer: bytes pushed
    // before the latch was raised are ordered ahead of it by the
    // buffer lock, so a true latch plus an empty buffer really is the
    // end of the stream.
    pub(crate) fn fetch(&self) -> Fetch {
        let end_of_data = *self.shared.end_of_data.lock().unwrap();
        let mut buffer = self.shared.buffer.lock().unwrap();

        match buffer.pop_front() {
            Some(byte) => Fetch::Byte(byte),
            None if end_of_data => Fetch::EndOfData,
            None => Fetch::Empty,
        }
    }
}
