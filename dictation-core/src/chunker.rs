//! Re-blocks arbitrary-sized PCM slices into fixed-size [`Chunk`]s (§4.2).
//!
//! This sits above the resampler: by the time bytes reach the chunker they
//! are already mono 16-bit PCM at the target sample rate. The numeric
//! pipeline downstream (VAD, inference) still works on `f32` samples, the
//! same as the teacher's `AudioChunk` — `Chunk` is the wire/session-boundary
//! representation the spec calls for (byte length invariants, `seq`,
//! `is_final`, base64 encoding), not a replacement for the f32 path.

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// An immutable, fixed-duration (except the final one) PCM block.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub samples: Vec<u8>,
    pub seq: u64,
    pub is_final: bool,
    pub rms_db: f32,
}

impl Chunk {
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.samples)
    }

    pub fn duration_s(&self, bytes_per_second: usize) -> f64 {
        if bytes_per_second == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / bytes_per_second as f64
    }

    /// Converts this chunk's PCM16LE bytes into `f32` samples in `[-1, 1]`,
    /// the representation the VAD and inference stages operate on.
    pub fn as_f32_samples(&self) -> Vec<f32> {
        self.samples
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect()
    }
}

fn compute_rms_db(bytes: &[u8]) -> f32 {
    if bytes.len() < 2 {
        return -100.0;
    }
    let samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
        .collect();
    if samples.is_empty() {
        return -100.0;
    }
    let mean_sq = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = mean_sq.sqrt().max(1e-8);
    20.0 * rms.log10()
}

/// Re-blocks incoming PCM slices into fixed-size [`Chunk`]s, maintaining a
/// pending remainder across calls. `is_final` appears exactly once, on
/// `flush()`, per the invariant in §4.2/§8.
pub struct Chunker {
    chunk_size: usize,
    pending: Vec<u8>,
    seq: u64,
    total_bytes_appended: u64,
    chunks_emitted: u64,
    flushed: bool,
    start: std::time::Instant,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        Self {
            chunk_size,
            pending: Vec::with_capacity(chunk_size * 2),
            seq: 0,
            total_bytes_appended: 0,
            chunks_emitted: 0,
            flushed: false,
            start: std::time::Instant::now(),
        }
    }

    /// Appends new PCM bytes, returning every full chunk now available.
    pub fn append(&mut self, data: &[u8]) -> Vec<Chunk> {
        if self.flushed {
            return Vec::new();
        }
        self.total_bytes_appended += data.len() as u64;
        self.pending.extend_from_slice(data);

        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let bytes: Vec<u8> = self.pending.drain(..self.chunk_size).collect();
            out.push(self.emit(bytes, false));
        }
        out
    }

    /// Emits whatever remains as a final chunk, even if shorter than
    /// `chunk_size`. Idempotent after the first call: subsequent calls
    /// return `None` and `append` becomes a no-op, preserving "exactly once".
    pub fn flush(&mut self) -> Option<Chunk> {
        if self.flushed {
            return None;
        }
        self.flushed = true;
        if self.pending.is_empty() {
            // Still emit a zero-length final marker so downstream consumers
            // always observe exactly one `is_final` chunk per session.
            return Some(self.emit(Vec::new(), true));
        }
        let bytes = std::mem::take(&mut self.pending);
        Some(self.emit(bytes, true))
    }

    fn emit(&mut self, bytes: Vec<u8>, is_final: bool) -> Chunk {
        let rms_db = compute_rms_db(&bytes);
        let chunk = Chunk {
            samples: bytes,
            seq: self.seq,
            is_final,
            rms_db,
        };
        self.seq += 1;
        self.chunks_emitted += 1;
        chunk
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes_appended
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.chunks_emitted
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    pub fn elapsed_s(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Accumulates sealed chunks for the current utterance. Lossless by
/// contract (§5): bounded only by `max_bytes`, never dropped silently —
/// exceeding the ceiling is a hard error the caller must surface as a
/// `Device`-class abort (§8 boundary behavior).
pub struct StreamingAudioBuffer {
    chunks: Vec<Chunk>,
    total_bytes: usize,
    max_bytes: usize,
}

impl StreamingAudioBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: Vec::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Returns `Err` once appending `chunk` would exceed `max_bytes`.
    pub fn push(&mut self, chunk: Chunk) -> Result<(), Chunk> {
        if self.total_bytes + chunk.samples.len() > self.max_bytes {
            return Err(chunk);
        }
        self.total_bytes += chunk.samples.len();
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn duration_s(&self, bytes_per_second: usize) -> f64 {
        if bytes_per_second == 0 {
            return 0.0;
        }
        self.total_bytes as f64 / bytes_per_second as f64
    }

    /// Concatenates all chunk bytes in order into a single PCM buffer,
    /// consuming the accumulator.
    pub fn seal(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk.samples);
        }
        out
    }

    /// Same concatenation as `seal`, without consuming the accumulator —
    /// for a mid-utterance partial-transcript snapshot while capture is
    /// still in progress.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.samples);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_then_concat_round_trips() {
        let data: Vec<u8> = (0u8..=255).cycle().take(3200 * 4).collect();
        let mut chunker = Chunker::new(3200);
        let mut reassembled = Vec::new();
        for chunk in chunker.append(&data) {
            assert_eq!(chunk.samples.len(), 3200);
            assert!(!chunk.is_final);
            reassembled.extend_from_slice(&chunk.samples);
        }
        if let Some(last) = chunker.flush() {
            assert!(last.is_final);
            reassembled.extend_from_slice(&last.samples);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn byte_accounting_invariant_holds() {
        let mut chunker = Chunker::new(1000);
        let emitted = chunker.append(&vec![0u8; 2500]);
        let emitted_bytes: usize = emitted.iter().map(|c| c.samples.len()).sum();
        assert_eq!(emitted_bytes as u64 + chunker.pending_bytes() as u64, 2500);
    }

    #[test]
    fn flush_is_final_exactly_once() {
        let mut chunker = Chunker::new(100);
        chunker.append(&vec![1u8; 250]);
        assert!(chunker.flush().unwrap().is_final);
        assert!(chunker.flush().is_none());
        assert!(chunker.append(&[1, 2, 3]).is_empty());
    }

    #[test]
    fn flush_with_no_remainder_still_emits_final_marker() {
        let mut chunker = Chunker::new(100);
        chunker.append(&vec![1u8; 100]);
        let last = chunker.flush().unwrap();
        assert!(last.is_final);
        assert!(last.samples.is_empty());
    }

    #[test]
    fn chunk_order_preserves_input_order() {
        let mut chunker = Chunker::new(4);
        let data = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let chunks = chunker.append(&data);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[1].seq, 1);
        assert_eq!(chunks[0].samples, vec![0, 1, 2, 3]);
        assert_eq!(chunks[1].samples, vec![4, 5, 6, 7]);
    }

    #[test]
    fn streaming_buffer_rejects_over_ceiling() {
        let mut buf = StreamingAudioBuffer::new(10);
        let small = Chunk {
            samples: vec![0; 6],
            seq: 0,
            is_final: false,
            rms_db: -100.0,
        };
        assert!(buf.push(small).is_ok());
        let too_big = Chunk {
            samples: vec![0; 6],
            seq: 1,
            is_final: false,
            rms_db: -100.0,
        };
        assert!(buf.push(too_big).is_err());
    }

    #[test]
    fn base64_encoding_round_trips() {
        let chunk = Chunk {
            samples: vec![1, 2, 3, 4],
            seq: 0,
            is_final: false,
            rms_db: 0.0,
        };
        let encoded = chunk.to_base64();
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, chunk.samples);
    }
}
