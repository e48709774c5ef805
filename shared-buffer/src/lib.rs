//! Append-only circular store of recent audio, bounded by duration.
//!
//! Samples are stored as `f32` normalized to `[-1, 1]`, converted once on
//! append from PCM16 so the ASR worker never has to repeat that conversion
//! before every call.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Converts one PCM16 sample to a normalized `f32` in `[-1, 1]`.
#[inline]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Converts a normalized `f32` sample back to PCM16, clamping to range.
#[inline]
pub fn f32_to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32768.0).round() as i16
}

/// A ring holding up to `buffer_seconds * sample_rate` samples.
///
/// Invariants: samples are contiguous in producer time order; appending
/// past capacity evicts the oldest samples; `tail` returns the most recent
/// slice clipped to available content; the total number of samples ever
/// written only grows.
pub struct AudioBuffer {
    sample_rate: u32,
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    samples: VecDeque<f32>,
    total_written: u64,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, buffer_seconds: f32) -> Self {
        let capacity = ((sample_rate as f64) * buffer_seconds as f64).round() as usize;
        Self {
            sample_rate,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(capacity.max(1)),
                total_written: 0,
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Appends PCM16 samples, converting to normalized float on the way in.
    /// Never fails; evicts from the head once capacity is exceeded.
    pub fn append(&self, pcm16: &[i16]) {
        let mut inner = self.inner.lock().expect("audio buffer poisoned");
        inner.total_written += pcm16.len() as u64;
        for &s in pcm16 {
            if inner.samples.len() >= self.capacity {
                inner.samples.pop_front();
            }
            inner.samples.push_back(pcm16_to_f32(s));
        }
    }

    /// Returns the last `min(seconds, available)` worth of samples as a
    /// contiguous copy. Snapshots atomically under a brief lock so readers
    /// never observe a torn write.
    pub fn tail(&self, seconds: f32) -> Vec<f32> {
        let inner = self.inner.lock().expect("audio buffer poisoned");
        let want = ((self.sample_rate as f64) * seconds as f64).round() as usize;
        let want = want.min(inner.samples.len());
        let skip = inner.samples.len() - want;
        inner.samples.iter().skip(skip).copied().collect()
    }

    /// Total samples currently held (after eviction).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("audio buffer poisoned").samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotone count of all samples ever appended, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.inner.lock().expect("audio buffer poisoned").total_written
    }

    /// Used only on session end.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("audio buffer poisoned");
        inner.samples.clear();
        inner.total_written = 0;
    }
}

/// RMS of a float32 slice, used by the ASR worker's silence/noise gate.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_f32_round_trip() {
        for x in [-32767i16, -1000, -1, 0, 1, 1000, 32767] {
            let f = pcm16_to_f32(x);
            let back = (f * 32768.0).round() as i32;
            assert_eq!(back, x as i32);
        }
    }

    #[test]
    fn append_never_exceeds_capacity() {
        let buf = AudioBuffer::new(16_000, 1.0); // capacity 16000
        let chunk = vec![100i16; 20_000];
        buf.append(&chunk);
        assert_eq!(buf.len(), 16_000);
        assert_eq!(buf.total_written(), 20_000);
    }

    #[test]
    fn tail_returns_most_recent_samples() {
        let buf = AudioBuffer::new(1_000, 2.0); // capacity 2000
        let ramp: Vec<i16> = (0..3000).map(|i| (i % 100) as i16).collect();
        buf.append(&ramp);
        let tail = buf.tail(2.0);
        assert_eq!(tail.len(), 2000);
        let expected: Vec<f32> = ramp[1000..].iter().map(|&s| pcm16_to_f32(s)).collect();
        assert_eq!(tail, expected);
    }

    #[test]
    fn tail_clips_to_available_when_buffer_not_full() {
        let buf = AudioBuffer::new(1_000, 5.0);
        buf.append(&[1, 2, 3]);
        let tail = buf.tail(5.0);
        assert_eq!(tail.len(), 3);
    }

    #[test]
    fn reset_clears_everything() {
        let buf = AudioBuffer::new(1_000, 1.0);
        buf.append(&[1, 2, 3]);
        buf.reset();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.total_written(), 0);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0.0, 0.0, 0.0]), 0.0);
    }
}
