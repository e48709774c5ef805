//! Per-segment and end-to-end timing aggregation (§4.7).

use std::time::Instant;

/// Timestamps captured at each stage for one segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentStats {
    pub segment_id: u64,
    pub t_commit: Option<Instant>,
    pub t_mt_done: Option<Instant>,
    pub t_tts_first_chunk: Option<Instant>,
    pub t_tts_done: Option<Instant>,
    /// Latency of the most recent ASR adapter call as of this segment's
    /// commit. ASR ticks on its own interval independent of commits, so this
    /// is the freshest available reading rather than a call scoped to this
    /// segment specifically.
    pub asr_ms: u64,
}

impl SegmentStats {
    pub fn new(segment_id: u64, t_commit: Instant) -> Self {
        Self {
            segment_id,
            t_commit: Some(t_commit),
            ..Default::default()
        }
    }

    pub fn mt_ms(&self) -> u64 {
        match (self.t_commit, self.t_mt_done) {
            (Some(a), Some(b)) => b.duration_since(a).as_millis() as u64,
            _ => 0,
        }
    }

    pub fn tts_ms(&self) -> u64 {
        match (self.t_mt_done, self.t_tts_first_chunk) {
            (Some(a), Some(b)) => b.duration_since(a).as_millis() as u64,
            _ => 0,
        }
    }

    /// End-to-end: commit to first TTS chunk delivered to the client.
    pub fn e2e_ms(&self) -> u64 {
        match (self.t_commit, self.t_tts_first_chunk) {
            (Some(a), Some(b)) => b.duration_since(a).as_millis() as u64,
            _ => 0,
        }
    }
}

/// Running counters across the whole session.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    pub commits_total: u64,
    pub tts_queue_ms: u64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&mut self) {
        self.commits_total += 1;
    }

    pub fn set_tts_queue_ms(&mut self, ms: u64) {
        self.tts_queue_ms = ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn e2e_spans_commit_to_first_chunk() {
        let t0 = Instant::now();
        let mut stats = SegmentStats::new(1, t0);
        stats.t_mt_done = Some(t0 + Duration::from_millis(50));
        stats.t_tts_first_chunk = Some(t0 + Duration::from_millis(120));
        assert_eq!(stats.mt_ms(), 50);
        assert_eq!(stats.tts_ms(), 70);
        assert_eq!(stats.e2e_ms(), 120);
    }

    #[test]
    fn aggregator_counts_commits() {
        let mut agg = StatsAggregator::new();
        agg.record_commit();
        agg.record_commit();
        assert_eq!(agg.commits_total, 2);
    }
}
