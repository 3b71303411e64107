//! Chunked-transfer streaming engine (component E).
//!
//! A single-producer/single-consumer ring buffer: the handler (producer) writes
//! chunks; the reactor thread (consumer) drains them onto the socket. Positions are
//! atomic so a future multi-threaded producer remains possible even though the
//! current model drives everything from one reactor thread (§5).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream buffer size {0} out of bounds [1024, 262144]")]
    InvalidBufferSize(usize),
    #[error("write after stream finished or aborted")]
    StreamClosed,
    #[error("underlying write failed: {0}")]
    WriteFailed(String),
}

/// Sentinel result for [`Stream::write_chunk`] mirroring the integer sentinel space
/// named in the interface contract (`BACKPRESSURE`, `OK`, `TIMEDOUT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok,
    Backpressure,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Ok,
    TimedOut,
}

const MIN_BUFFER: usize = 1024;
const MAX_BUFFER: usize = 262_144;
const DRAIN_CHUNK: usize = 8 * 1024;
const DEFAULT_MAX_PENDING_WRITES: u64 = 50;
const WRITE_ASYNC_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Pick a ring buffer size class for an expected total body size (§4.E "Size
/// classes").
pub fn optimal_buffer_size(expected_total: usize) -> usize {
    if expected_total < 1024 {
        1024
    } else if expected_total < 64 * 1024 {
        8 * 1024
    } else if expected_total < 1024 * 1024 {
        64 * 1024
    } else {
        256 * 1024
    }
}

/// A scatter-write chunk ready to hand to the socket: header, payload, trailer.
pub struct FramedChunk {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
    pub trailer: &'static [u8],
}

fn frame_chunk(payload: Vec<u8>) -> FramedChunk {
    let header = format!("{:x}\r\n", payload.len()).into_bytes();
    FramedChunk {
        header,
        payload,
        trailer: b"\r\n",
    }
}

/// A chunked-transfer stream context (§3 "Stream context").
pub struct Stream {
    buffer: Mutex<Vec<u8>>,
    capacity: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    active: AtomicBool,
    pending_writes: AtomicU64,
    max_pending_writes: u64,
    backpressure_active: AtomicBool,
    headers_sent: AtomicBool,
    bytes_streamed: AtomicU64,
    start_time: Instant,
    error: Mutex<Option<String>>,
    status: u16,
    content_type: String,
}

impl Stream {
    pub fn create(buffer_size: usize, status: u16, content_type: &str) -> Result<Self, StreamError> {
        if !(MIN_BUFFER..=MAX_BUFFER).contains(&buffer_size) {
            return Err(StreamError::InvalidBufferSize(buffer_size));
        }
        Ok(Stream {
            buffer: Mutex::new(vec![0u8; buffer_size]),
            capacity: buffer_size,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            pending_writes: AtomicU64::new(0),
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            backpressure_active: AtomicBool::new(false),
            headers_sent: AtomicBool::new(false),
            bytes_streamed: AtomicU64::new(0),
            start_time: Instant::now(),
            error: Mutex::new(None),
            status,
            content_type: content_type.to_string(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.error.lock().unwrap().is_none()
    }

    pub fn has_backpressure(&self) -> bool {
        self.backpressure_active.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    /// Stream startup headers, sent once, on the first chunk (§4.E "Headers").
    pub fn header_block(&self) -> Option<Vec<u8>> {
        if self.headers_sent.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(
            format!(
                "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n",
                self.status,
                crate::response::reason_phrase(self.status),
                self.content_type,
            )
            .into_bytes(),
        )
    }

    fn occupied(&self, read: usize, write: usize) -> usize {
        (write + self.capacity - read) % self.capacity
    }

    fn available_write(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        self.capacity - self.occupied(read, write) - 1
    }

    /// Copy `bytes` into the ring buffer with wrap-around, or signal backpressure
    /// if there isn't room (§4.E "On write_chunk").
    pub fn write_chunk(&self, bytes: &[u8]) -> WriteOutcome {
        if !self.is_active() {
            return WriteOutcome::Closed;
        }
        if bytes.len() > self.available_write() {
            self.backpressure_active.store(true, Ordering::Release);
            return WriteOutcome::Backpressure;
        }

        let mut buf = self.buffer.lock().unwrap();
        let write = self.write_pos.load(Ordering::Acquire);
        let cap = self.capacity;
        for (i, b) in bytes.iter().enumerate() {
            buf[(write + i) % cap] = *b;
        }
        drop(buf);
        self.write_pos.store((write + bytes.len()) % cap, Ordering::Release);
        WriteOutcome::Ok
    }

    /// Drain up to [`DRAIN_CHUNK`] bytes into a staging buffer, frame it, and
    /// return the frame for the reactor to scatter-write.
    pub fn drain(&self) -> Option<FramedChunk> {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        let available = self.occupied(read, write);
        if available == 0 {
            return None;
        }
        let take = available.min(DRAIN_CHUNK);

        let buf = self.buffer.lock().unwrap();
        let mut staging = Vec::with_capacity(take);
        for i in 0..take {
            staging.push(buf[(read + i) % self.capacity]);
        }
        drop(buf);

        self.read_pos.store((read + take) % self.capacity, Ordering::Release);
        self.pending_writes.fetch_add(1, Ordering::AcqRel);
        self.bytes_streamed.fetch_add(take as u64, Ordering::Relaxed);
        Some(frame_chunk(staging))
    }

    /// Called by the reactor when a scatter-write completes. Clears backpressure
    /// once `pending_writes` drops below the threshold (§4.E "On write completion").
    pub fn on_write_complete(&self) {
        let remaining = self.pending_writes.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining < self.max_pending_writes && self.backpressure_active.swap(false, Ordering::AcqRel) {
            tracing::debug!("stream backpressure cleared");
        }
    }

    pub fn finish(&self) -> Vec<u8> {
        self.active.store(false, Ordering::Release);
        b"0\r\n\r\n".to_vec()
    }

    /// Mark inactive without emitting a terminator (§4.E "abort").
    pub fn abort(&self) {
        self.active.store(false, Ordering::Release);
        *self.error.lock().unwrap() = Some("aborted".to_string());
    }

    pub fn record_error(&self, message: String) {
        *self.error.lock().unwrap() = Some(message);
        self.active.store(false, Ordering::Release);
    }

    /// Poll once, then sleep 1ms, until data drains or `timeout` elapses
    /// (§5 "the only yielding points are ... wait_for_drain").
    pub async fn wait_for_drain(&self, timeout: Duration) -> DrainOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.has_backpressure() {
                return DrainOutcome::Ok;
            }
            if Instant::now() >= deadline {
                return DrainOutcome::TimedOut;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Async write counterpart to [`Stream::write_chunk`] (§4.E "write_async"): waits
    /// out backpressure once before giving up, then hands the outcome to `callback`
    /// rather than returning it directly.
    pub async fn write_async<F>(&self, bytes: &[u8], callback: F)
    where
        F: FnOnce(WriteOutcome),
    {
        let outcome = match self.write_chunk(bytes) {
            WriteOutcome::Backpressure => {
                if self.wait_for_drain(WRITE_ASYNC_DRAIN_TIMEOUT).await == DrainOutcome::Ok {
                    self.write_chunk(bytes)
                } else {
                    WriteOutcome::Backpressure
                }
            }
            other => other,
        };
        callback(outcome);
    }

    pub fn throughput_mbps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let bytes = self.bytes_streamed.load(Ordering::Relaxed) as f64;
        (bytes * 8.0) / elapsed / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimal_buffer_size_picks_class() {
        assert_eq!(optimal_buffer_size(500), 1024);
        assert_eq!(optimal_buffer_size(10_000), 8192);
        assert_eq!(optimal_buffer_size(500_000), 65536);
        assert_eq!(optimal_buffer_size(2_000_000), 262_144);
    }

    #[test]
    fn rejects_out_of_bounds_buffer_size() {
        assert!(Stream::create(100, 200, "text/plain").is_err());
        assert!(Stream::create(1_000_000, 200, "text/plain").is_err());
    }

    #[test]
    fn write_then_drain_round_trips_payload() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        assert_eq!(stream.write_chunk(b"hello"), WriteOutcome::Ok);
        let chunk = stream.drain().unwrap();
        assert_eq!(chunk.payload, b"hello");
        assert_eq!(chunk.header, b"5\r\n");
        assert_eq!(chunk.trailer, b"\r\n");
    }

    #[test]
    fn write_chunk_signals_backpressure_when_full() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        let huge = vec![0u8; 1024];
        assert_eq!(stream.write_chunk(&huge), WriteOutcome::Backpressure);
        assert!(stream.has_backpressure());
    }

    #[test]
    fn on_write_complete_clears_backpressure_below_threshold() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        stream.backpressure_active.store(true, Ordering::Release);
        stream.pending_writes.store(1, Ordering::Release);
        stream.on_write_complete();
        assert!(!stream.has_backpressure());
    }

    #[test]
    fn finish_emits_terminator_and_deactivates() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        let term = stream.finish();
        assert_eq!(term, b"0\r\n\r\n");
        assert!(!stream.is_active());
    }

    #[test]
    fn abort_skips_terminator() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        stream.abort();
        assert!(!stream.is_active());
        assert!(stream.error().is_some());
    }

    #[test]
    fn write_after_close_is_rejected() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        stream.finish();
        assert_eq!(stream.write_chunk(b"late"), WriteOutcome::Closed);
    }

    #[tokio::test]
    async fn wait_for_drain_times_out_under_sustained_backpressure() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        stream.backpressure_active.store(true, Ordering::Release);
        let outcome = stream.wait_for_drain(Duration::from_millis(5)).await;
        assert_eq!(outcome, DrainOutcome::TimedOut);
    }

    #[tokio::test]
    async fn wait_for_drain_returns_ok_when_no_backpressure() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        let outcome = stream.wait_for_drain(Duration::from_millis(5)).await;
        assert_eq!(outcome, DrainOutcome::Ok);
    }

    #[tokio::test]
    async fn write_async_delivers_ok_outcome_to_callback() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        stream.write_async(b"hello", move |outcome| tx.send(outcome).unwrap()).await;
        assert_eq!(rx.recv().unwrap(), WriteOutcome::Ok);
    }

    #[tokio::test]
    async fn write_async_retries_after_drain_clears_backpressure() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        assert_eq!(stream.write_chunk(&vec![0u8; 1020]), WriteOutcome::Ok);
        let huge = vec![0u8; 16];
        assert_eq!(stream.write_chunk(&huge), WriteOutcome::Backpressure);

        let drained = std::sync::Arc::new(stream);
        let reader = drained.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            reader.drain();
            reader.on_write_complete();
        });

        let (tx, rx) = std::sync::mpsc::channel();
        drained.write_async(&huge, move |outcome| tx.send(outcome).unwrap()).await;
        assert_eq!(rx.recv().unwrap(), WriteOutcome::Ok);
    }

    #[test]
    fn header_block_is_sent_exactly_once() {
        let stream = Stream::create(1024, 200, "text/plain").unwrap();
        assert!(stream.header_block().is_some());
        assert!(stream.header_block().is_none());
    }
}
