//! zlib input/output filter.
//!
//! Output is deflated with a sync flush after every write so that each
//! element reaches the server as soon as it is sent. Input is inflated
//! incrementally; a chunk may yield no output until more data arrives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use modular_xmpp_fsm::{FilterError, InputOutputFilter, StatsReport};
use tracing::trace;

use crate::error::CompressionError;

const FILTER_NAME: &str = "zlib";

const MINIMUM_OUTPUT_BUFFER: usize = 64;
const MINIMUM_OUTPUT_BUFFER_INCREASE: usize = 480;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn consumed(before: u64, after: u64) -> usize {
    usize::try_from(after - before).unwrap_or(usize::MAX)
}

#[derive(Debug, Default)]
struct Counters {
    compressor_in: AtomicU64,
    compressor_out: AtomicU64,
    decompressor_in: AtomicU64,
    decompressor_out: AtomicU64,
}

pub struct ZlibFilter {
    compressor: Mutex<Compress>,
    decompressor: Mutex<Decompress>,
    counters: Counters,
    closed: AtomicBool,
}

impl ZlibFilter {
    /// A filter deflating at `level` (0-9).
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            compressor: Mutex::new(Compress::new(Compression::new(level.min(9)), true)),
            decompressor: Mutex::new(Decompress::new(true)),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn deflate(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CompressionError::Closed);
        }
        let mut compressor = lock(&self.compressor);
        let mut out = Vec::with_capacity(data.len().max(MINIMUM_OUTPUT_BUFFER));
        let mut offset = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(MINIMUM_OUTPUT_BUFFER_INCREASE));
            }
            let before = compressor.total_in();
            compressor.compress_vec(&data[offset..], &mut out, FlushCompress::Sync)?;
            offset += consumed(before, compressor.total_in());
            // The flush is complete once all input is taken and the
            // compressor stopped short of filling the buffer.
            if offset >= data.len() && out.len() < out.capacity() {
                break;
            }
        }

        self.counters
            .compressor_in
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.counters
            .compressor_out
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        trace!(input = data.len(), output = out.len(), "deflated");
        Ok(out)
    }

    pub fn inflate(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CompressionError::Closed);
        }
        let mut decompressor = lock(&self.decompressor);
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).max(MINIMUM_OUTPUT_BUFFER));
        let mut offset = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity());
            }
            let before = decompressor.total_in();
            let status =
                decompressor.decompress_vec(&data[offset..], &mut out, FlushDecompress::Sync)?;
            offset += consumed(before, decompressor.total_in());
            let stalled = out.len() < out.capacity();
            if status == Status::StreamEnd || (stalled && (offset >= data.len() || status == Status::BufError)) {
                break;
            }
        }

        self.counters
            .decompressor_in
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.counters
            .decompressor_out
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for ZlibFilter {
    fn default() -> Self {
        Self::new(Compression::default().level())
    }
}

impl std::fmt::Debug for ZlibFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibFilter")
            .field("counters", &self.counters)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl InputOutputFilter for ZlibFilter {
    fn filter_name(&self) -> &str {
        FILTER_NAME
    }

    fn output(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        self.deflate(data)
            .map_err(|e| e.into_filter_error(FILTER_NAME))
    }

    fn input(&self, data: &[u8]) -> Result<Vec<u8>, FilterError> {
        self.inflate(data)
            .map_err(|e| e.into_filter_error(FILTER_NAME))
    }

    fn close_input_output(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn stats(&self) -> StatsReport {
        let c = &self.counters;
        let compressor_in = c.compressor_in.load(Ordering::Relaxed);
        let compressor_out = c.compressor_out.load(Ordering::Relaxed);
        let decompressor_in = c.decompressor_in.load(Ordering::Relaxed);
        let decompressor_out = c.decompressor_out.load(Ordering::Relaxed);
        StatsReport::new()
            .with("compressor-in-bytes", compressor_in)
            .with("compressor-out-bytes", compressor_out)
            .with("compression-ratio", ratio(compressor_out, compressor_in))
            .with("decompressor-in-bytes", decompressor_in)
            .with("decompressor-out-bytes", decompressor_out)
            .with("decompression-ratio", ratio(decompressor_in, decompressor_out))
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64) -> String {
    if denominator == 0 {
        return "n/a".to_string();
    }
    format!("{:.3}", numerator as f64 / denominator as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_inflates_back() {
        let client = ZlibFilter::default();
        let server = ZlibFilter::default();
        let stanza = b"<message to='romeo@example.org'><body>Wherefore art thou?</body></message>";

        let wire = client.output(stanza).unwrap();
        assert_eq!(server.input(&wire).unwrap(), stanza);

        // The stream continues across writes.
        let wire = client.output(b"<presence/>").unwrap();
        assert_eq!(server.input(&wire).unwrap(), b"<presence/>");
    }

    #[test]
    fn large_output_grows_buffer() {
        let client = ZlibFilter::new(0);
        let server = ZlibFilter::default();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let wire = client.output(&data).unwrap();
        assert!(wire.len() > data.len());
        assert_eq!(server.input(&wire).unwrap(), data);
    }

    #[test]
    fn split_input_is_buffered() {
        let client = ZlibFilter::default();
        let server = ZlibFilter::default();
        let wire = client.output(b"<iq type='get' id='1'/>").unwrap();

        let (first, second) = wire.split_at(wire.len() / 2);
        let mut inflated = server.input(first).unwrap();
        inflated.extend(server.input(second).unwrap());
        assert_eq!(inflated, b"<iq type='get' id='1'/>");
    }

    #[test]
    fn garbage_input_fails() {
        let server = ZlibFilter::default();
        let err = server.input(b"definitely not zlib").unwrap_err();
        assert!(matches!(err, FilterError::Transform { ref filter, .. } if filter == "zlib"));
    }

    #[test]
    fn closed_filter_rejects_data() {
        let filter = ZlibFilter::default();
        filter.close_input_output();
        assert!(filter.is_closed());
        assert!(filter.output(b"<presence/>").is_err());
    }

    #[test]
    fn stats_count_bytes() {
        let filter = ZlibFilter::default();
        assert_eq!(filter.stats().get("compression-ratio"), Some("n/a"));

        filter.output(&[b'a'; 1000]).unwrap();
        let stats = filter.stats();
        assert_eq!(stats.get("compressor-in-bytes"), Some("1000"));
        let out: u64 = stats.get("compressor-out-bytes").unwrap().parse().unwrap();
        assert!(out > 0 && out < 1000);
        assert_eq!(stats.get("decompressor-in-bytes"), Some("0"));
    }
}
