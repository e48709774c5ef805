//! Wires the stages together: the circular audio window, the periodic ASR
//! worker, the stability-K commit tracker, the translation stage, and the
//! TTS stage with backpressure. Stages are connected by bounded
//! `tokio::mpsc` channels (§9: "async callbacks → explicit stages
//! connected by bounded queues").

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shared_buffer::{rms, AudioBuffer};

use crate::adapters::{AsrAdapter, MtAdapter, TtsAdapter};
use crate::backpressure::BackpressureController;
use crate::commit::CommitTracker;
use crate::stats::SegmentStats;
use crate::PipelineError;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const STAGE_CHANNEL_CAPACITY: usize = 32;

/// Events the orchestrator emits; the session endpoint maps these 1:1 onto
/// outbound wire frames (§6).
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PartialTranscript {
        text: String,
    },
    CommittedTranscript {
        text: String,
        segment_id: u64,
    },
    TranslationCommitted {
        text: String,
        source: String,
        segment_id: u64,
    },
    TtsAudioChunk {
        samples: Vec<i16>,
        segment_id: u64,
        sample_rate: u32,
    },
    TtsEnd {
        segment_id: u64,
    },
    Stats {
        asr_ms: u64,
        mt_ms: u64,
        tts_ms: u64,
        e2e_ms: u64,
        commits_total: u64,
        tts_queue: u64,
    },
    Error {
        message: String,
        segment_id: Option<u64>,
    },
}

/// Tunables for one orchestrator instance, resolved from [`shared_protocol::
/// SessionConfig`] plus server-wide defaults (§6 env keys).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub source_lang: String,
    pub target_lang: String,
    pub window_seconds: f32,
    pub asr_interval: Duration,
    pub commit_k: usize,
    pub commit_timeout: Duration,
    pub commit_min_words: usize,
    pub buffer_limit_ms: u64,
    pub min_audio_seconds: f32,
    pub silence_rms_threshold: f32,
    pub hallucination_denylist: Vec<String>,
    pub max_repeated_ngram_ratio: f32,
    pub asr_call_timeout: Duration,
    pub mt_call_timeout: Duration,
    pub tts_call_timeout: Duration,
    pub tts_sample_rate: u32,
    pub voice_config: String,
    pub coalesce_wait: Duration,
    pub degraded_min_words: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let defaults = shared_protocol::SessionDefaults::default();
        Self {
            source_lang: "auto".to_string(),
            target_lang: "en".to_string(),
            window_seconds: defaults.window_seconds,
            asr_interval: Duration::from_millis(defaults.asr_interval_ms),
            commit_k: defaults.commit_stability_k,
            commit_timeout: Duration::from_secs_f32(defaults.commit_timeout_seconds),
            commit_min_words: defaults.commit_min_words,
            buffer_limit_ms: defaults.buffer_limit_ms,
            min_audio_seconds: 0.5,
            silence_rms_threshold: 0.01,
            hallucination_denylist: vec![
                "subscribe".to_string(),
                "like and subscribe".to_string(),
                "[music]".to_string(),
                "[blank_audio]".to_string(),
            ],
            max_repeated_ngram_ratio: 0.6,
            asr_call_timeout: Duration::from_secs(10),
            mt_call_timeout: Duration::from_secs(10),
            tts_call_timeout: Duration::from_secs(30),
            tts_sample_rate: shared_protocol::OUTBOUND_SAMPLE_RATE,
            voice_config: "default".to_string(),
            coalesce_wait: Duration::from_millis(300),
            degraded_min_words: 3,
        }
    }
}

/// A unit of committed text flowing from the commit tracker into MT.
#[derive(Debug, Clone)]
struct Segment {
    segment_id: u64,
    source_text: String,
    t_commit: Instant,
}

/// A segment after translation, ready for TTS.
#[derive(Debug, Clone)]
struct TranslatedSegment {
    segment_id: u64,
    source_text: String,
    translated_text: String,
    t_commit: Instant,
    t_mt_done: Instant,
}

/// Wraps a channel payload so a stage can propagate an orderly shutdown
/// signal after its last real item, instead of the channel just closing.
enum StageMsg<T> {
    Item(T),
    Stop,
}

fn is_hallucination(text: &str, denylist: &[String]) -> bool {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return true;
    }
    denylist.iter().any(|pat| normalized == pat.to_lowercase())
}

/// Ratio of repeated word-trigrams to total trigrams; a crude proxy for
/// decoder loops ("the the the the ...").
fn repeated_ngram_ratio(text: &str, n: usize) -> f32 {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < n + 1 {
        return 0.0;
    }
    let mut grams = std::collections::HashMap::new();
    let mut total = 0usize;
    for window in words.windows(n) {
        *grams.entry(window.join(" ")).or_insert(0usize) += 1;
        total += 1;
    }
    let repeated: usize = grams.values().filter(|&&c| c > 1).map(|&c| c - 1).sum();
    if total == 0 {
        0.0
    } else {
        repeated as f32 / total as f32
    }
}

/// Owns all per-session state and the spawned stage tasks. Created via
/// [`Orchestrator::spawn`].
pub struct Orchestrator {
    buffer: Arc<AudioBuffer>,
    stop_flag: Arc<AtomicBool>,
    asr_task: Option<JoinHandle<()>>,
    commit_task: Option<JoinHandle<()>>,
    mt_task: Option<JoinHandle<()>>,
    tts_task: Option<JoinHandle<()>>,
    hypo_tx: mpsc::Sender<StageMsg<String>>,
}

pub type OrchestratorHandle = Orchestrator;

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: OrchestratorConfig,
        asr: Arc<dyn AsrAdapter>,
        mt: Arc<dyn MtAdapter>,
        tts: Arc<dyn TtsAdapter>,
    ) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let buffer = Arc::new(AudioBuffer::new(
            shared_protocol::INBOUND_SAMPLE_RATE,
            (config.window_seconds * 4.0).max(config.window_seconds + 2.0),
        ));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (hypo_tx, hypo_rx) = mpsc::channel::<StageMsg<String>>(STAGE_CHANNEL_CAPACITY);
        let (seg_tx, seg_rx) = mpsc::channel::<StageMsg<Segment>>(STAGE_CHANNEL_CAPACITY);
        let (tr_tx, tr_rx) = mpsc::channel::<StageMsg<TranslatedSegment>>(STAGE_CHANNEL_CAPACITY);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let backpressure = Arc::new(Mutex::new(BackpressureController::new(
            config.buffer_limit_ms,
            config.commit_min_words,
            config.degraded_min_words,
        )));
        let latest_asr_ms = Arc::new(AtomicU64::new(0));

        let asr_task = tokio::spawn(asr_worker(
            config.clone(),
            Arc::clone(&buffer),
            asr,
            hypo_tx.clone(),
            event_tx.clone(),
            Arc::clone(&stop_flag),
            Arc::clone(&latest_asr_ms),
        ));

        let commit_task = tokio::spawn(commit_stage(
            config.clone(),
            hypo_rx,
            seg_tx,
            event_tx.clone(),
            Arc::clone(&backpressure),
        ));

        let mt_task = tokio::spawn(mt_stage(config.clone(), seg_rx, tr_tx, mt, event_tx.clone()));

        let tts_task = tokio::spawn(tts_stage(
            config.clone(),
            tr_rx,
            tts,
            event_tx,
            backpressure,
            latest_asr_ms,
        ));

        (
            Self {
                buffer,
                stop_flag,
                asr_task: Some(asr_task),
                commit_task: Some(commit_task),
                mt_task: Some(mt_task),
                tts_task: Some(tts_task),
                hypo_tx,
            },
            event_rx,
        )
    }

    /// The audio buffer's sample rate; sessions reject audio frames that
    /// don't match it (§4.1 protocol error).
    pub fn input_sample_rate(&self) -> u32 {
        self.buffer.sample_rate()
    }

    /// Appends PCM16 audio in arrival order; never fails.
    pub fn append_audio(&self, pcm16: &[i16]) {
        self.buffer.append(pcm16);
    }

    /// Cancels the ASR timer, forces a final commit, and waits for
    /// outstanding MT/TTS work to drain. No in-flight model call is
    /// forcibly aborted.
    pub async fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(h) = self.asr_task.take() {
            let _ = h.await;
        }
        let _ = self.hypo_tx.send(StageMsg::Stop).await;
        if let Some(h) = self.commit_task.take() {
            let _ = h.await;
        }
        if let Some(h) = self.mt_task.take() {
            let _ = h.await;
        }
        if let Some(h) = self.tts_task.take() {
            let _ = h.await;
        }
        self.buffer.reset();
    }
}

async fn asr_worker(
    config: OrchestratorConfig,
    buffer: Arc<AudioBuffer>,
    asr: Arc<dyn AsrAdapter>,
    hypo_tx: mpsc::Sender<StageMsg<String>>,
    event_tx: mpsc::Sender<PipelineEvent>,
    stop_flag: Arc<AtomicBool>,
    latest_asr_ms: Arc<AtomicU64>,
) {
    let mut interval = tokio::time::interval(config.asr_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }

        let samples = buffer.tail(config.window_seconds);
        let min_samples =
            (config.min_audio_seconds * buffer.sample_rate() as f32).round() as usize;
        if samples.len() < min_samples {
            continue;
        }
        if rms(&samples) < config.silence_rms_threshold {
            continue;
        }

        let call = asr.transcribe(&samples, buffer.sample_rate(), &config.source_lang);
        let started = Instant::now();
        let result = tokio::time::timeout(config.asr_call_timeout, call).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let text = match result {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                let err = PipelineError::Asr(e.to_string());
                warn!(error = %err, "ASR adapter call failed, continuing");
                continue;
            }
            Err(_) => {
                let err = PipelineError::Timeout(config.asr_call_timeout);
                warn!(error = %err, "ASR call timed out");
                continue;
            }
        };
        debug!(elapsed_ms, "ASR tick complete");
        latest_asr_ms.store(elapsed_ms, Ordering::Relaxed);

        let trimmed = text.trim();
        if is_hallucination(trimmed, &config.hallucination_denylist) {
            continue;
        }
        if repeated_ngram_ratio(trimmed, 3) > config.max_repeated_ngram_ratio {
            continue;
        }

        let _ = event_tx
            .send(PipelineEvent::PartialTranscript {
                text: trimmed.to_string(),
            })
            .await;

        if hypo_tx
            .send(StageMsg::Item(trimmed.to_string()))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn commit_stage(
    config: OrchestratorConfig,
    mut hypo_rx: mpsc::Receiver<StageMsg<String>>,
    seg_tx: mpsc::Sender<StageMsg<Segment>>,
    event_tx: mpsc::Sender<PipelineEvent>,
    backpressure: Arc<Mutex<BackpressureController>>,
) {
    let mut tracker = CommitTracker::new(
        config.commit_k,
        config.commit_timeout,
        config.commit_min_words,
        Instant::now(),
    );
    let mut last_text = String::new();

    while let Some(msg) = hypo_rx.recv().await {
        match msg {
            StageMsg::Item(text) => {
                last_text = text.clone();
                let hint = backpressure.lock().await.min_words_hint();
                tracker.set_min_words(hint);

                if let Some(commit) = tracker.on_hypothesis(&text, Instant::now()) {
                    emit_commit(&event_tx, &seg_tx, commit.segment_id, commit.delta_text).await;
                }
            }
            StageMsg::Stop => {
                if let Some(commit) = tracker.force_commit(&last_text, Instant::now()) {
                    emit_commit(&event_tx, &seg_tx, commit.segment_id, commit.delta_text).await;
                }
                let _ = seg_tx.send(StageMsg::Stop).await;
                break;
            }
        }
    }
}

async fn emit_commit(
    event_tx: &mpsc::Sender<PipelineEvent>,
    seg_tx: &mpsc::Sender<StageMsg<Segment>>,
    segment_id: u64,
    delta_text: String,
) {
    let _ = event_tx
        .send(PipelineEvent::CommittedTranscript {
            text: delta_text.clone(),
            segment_id,
        })
        .await;
    let _ = seg_tx
        .send(StageMsg::Item(Segment {
            segment_id,
            source_text: delta_text,
            t_commit: Instant::now(),
        }))
        .await;
}

async fn mt_stage(
    config: OrchestratorConfig,
    mut seg_rx: mpsc::Receiver<StageMsg<Segment>>,
    tr_tx: mpsc::Sender<StageMsg<TranslatedSegment>>,
    mt: Arc<dyn MtAdapter>,
    event_tx: mpsc::Sender<PipelineEvent>,
) {
    while let Some(msg) = seg_rx.recv().await {
        match msg {
            StageMsg::Item(segment) => {
                let call = mt.translate(&segment.source_text, &config.source_lang, &config.target_lang);
                match tokio::time::timeout(config.mt_call_timeout, call).await {
                    Ok(Ok(translated)) => {
                        let t_mt_done = Instant::now();
                        let _ = event_tx
                            .send(PipelineEvent::TranslationCommitted {
                                text: translated.clone(),
                                source: segment.source_text.clone(),
                                segment_id: segment.segment_id,
                            })
                            .await;
                        let _ = tr_tx
                            .send(StageMsg::Item(TranslatedSegment {
                                segment_id: segment.segment_id,
                                source_text: segment.source_text,
                                translated_text: translated,
                                t_commit: segment.t_commit,
                                t_mt_done,
                            }))
                            .await;
                    }
                    Ok(Err(e)) => {
                        let err = PipelineError::Mt(e.to_string());
                        error!(segment_id = segment.segment_id, error = %err, "MT adapter failed");
                        let _ = event_tx
                            .send(PipelineEvent::Error {
                                message: err.to_string(),
                                segment_id: Some(segment.segment_id),
                            })
                            .await;
                        // skip TTS for this segment, per §4.5 failure mode
                    }
                    Err(_) => {
                        let err = PipelineError::Timeout(config.mt_call_timeout);
                        let _ = event_tx
                            .send(PipelineEvent::Error {
                                message: err.to_string(),
                                segment_id: Some(segment.segment_id),
                            })
                            .await;
                    }
                }
            }
            StageMsg::Stop => {
                let _ = tr_tx.send(StageMsg::Stop).await;
                break;
            }
        }
    }
}

async fn tts_stage(
    config: OrchestratorConfig,
    mut tr_rx: mpsc::Receiver<StageMsg<TranslatedSegment>>,
    tts: Arc<dyn TtsAdapter>,
    event_tx: mpsc::Sender<PipelineEvent>,
    backpressure: Arc<Mutex<BackpressureController>>,
    latest_asr_ms: Arc<AtomicU64>,
) {
    let mut commits_total: u64 = 0;

    loop {
        let first = match tr_rx.recv().await {
            Some(StageMsg::Item(seg)) => seg,
            Some(StageMsg::Stop) | None => break,
        };

        let degraded = backpressure.lock().await.should_coalesce();
        let batch = if degraded {
            coalesce_one(&mut tr_rx, first, config.coalesce_wait).await
        } else {
            first
        };

        commits_total += 1;
        synthesize_segment(
            &config,
            &tts,
            &batch,
            &event_tx,
            &backpressure,
            commits_total,
            latest_asr_ms.load(Ordering::Relaxed),
        )
        .await;
    }
}

/// Waits briefly for one more segment to merge with `first`, per the
/// degraded-mode coalescing rule (§4.6 step 1).
async fn coalesce_one(
    rx: &mut mpsc::Receiver<StageMsg<TranslatedSegment>>,
    first: TranslatedSegment,
    wait: Duration,
) -> TranslatedSegment {
    match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Some(StageMsg::Item(second))) => TranslatedSegment {
            segment_id: second.segment_id,
            source_text: format!("{} {}", first.source_text, second.source_text),
            translated_text: format!("{} {}", first.translated_text, second.translated_text),
            t_commit: first.t_commit,
            t_mt_done: second.t_mt_done,
        },
        _ => first,
    }
}

async fn synthesize_segment(
    config: &OrchestratorConfig,
    tts: &Arc<dyn TtsAdapter>,
    segment: &TranslatedSegment,
    event_tx: &mpsc::Sender<PipelineEvent>,
    backpressure: &Arc<Mutex<BackpressureController>>,
    commits_total: u64,
    asr_ms: u64,
) {
    use futures_util::StreamExt;

    let mut stats = SegmentStats::new(segment.segment_id, segment.t_commit);
    stats.t_mt_done = Some(segment.t_mt_done);
    stats.asr_ms = asr_ms;

    let call = tts.synthesize_streaming(&segment.translated_text, &config.voice_config);
    let stream = match tokio::time::timeout(config.tts_call_timeout, call).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let err = PipelineError::Tts(e.to_string());
            let _ = event_tx
                .send(PipelineEvent::Error {
                    message: err.to_string(),
                    segment_id: Some(segment.segment_id),
                })
                .await;
            return;
        }
        Err(_) => {
            let err = PipelineError::Timeout(config.tts_call_timeout);
            let _ = event_tx
                .send(PipelineEvent::Error {
                    message: err.to_string(),
                    segment_id: Some(segment.segment_id),
                })
                .await;
            return;
        }
    };

    tokio::pin!(stream);
    let mut total_duration_ms: u64 = 0;
    let mut first_chunk_at: Option<Instant> = None;

    while let Some(chunk) = stream.next().await {
        let samples = match chunk {
            Ok(samples) => samples,
            Err(e) => {
                warn!(segment_id = segment.segment_id, error = %e, "TTS chunk error, stopping segment");
                break;
            }
        };
        let duration_ms = (samples.len() as u64 * 1000) / config.tts_sample_rate as u64;
        total_duration_ms += duration_ms;
        if first_chunk_at.is_none() {
            first_chunk_at = Some(Instant::now());
            stats.t_tts_first_chunk = first_chunk_at;
        }

        backpressure.lock().await.add_queued(duration_ms);

        let _ = event_tx
            .send(PipelineEvent::TtsAudioChunk {
                samples,
                segment_id: segment.segment_id,
                sample_rate: config.tts_sample_rate,
            })
            .await;
    }

    stats.t_tts_done = Some(Instant::now());
    let _ = event_tx
        .send(PipelineEvent::TtsEnd {
            segment_id: segment.segment_id,
        })
        .await;

    let elapsed_since_first_ms = first_chunk_at
        .map(|t| t.elapsed().as_millis() as u64)
        .unwrap_or(0);
    let decrement = total_duration_ms.saturating_sub(elapsed_since_first_ms);
    let queue_ms = {
        let mut bp = backpressure.lock().await;
        bp.remove_queued(decrement);
        bp.queued_ms()
    };

    let _ = event_tx
        .send(PipelineEvent::Stats {
            asr_ms: stats.asr_ms,
            mt_ms: stats.mt_ms(),
            tts_ms: stats.tts_ms(),
            e2e_ms: stats.e2e_ms(),
            commits_total,
            tts_queue: queue_ms,
        })
        .await;
    info!(segment_id = segment.segment_id, e2e_ms = stats.e2e_ms(), "segment complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockAsr, MockMt, MockTts};

    fn test_config() -> OrchestratorConfig {
        let mut c = OrchestratorConfig::default();
        c.asr_interval = Duration::from_millis(20);
        c.min_audio_seconds = 0.01;
        c.silence_rms_threshold = 0.0;
        c.commit_k = 1;
        c
    }

    #[tokio::test]
    async fn end_to_end_produces_committed_and_tts_events() {
        let config = test_config();
        let asr: Arc<dyn AsrAdapter> = Arc::new(MockAsr {
            fixed_reply: "hola mundo".to_string(),
        });
        let mt: Arc<dyn MtAdapter> = Arc::new(MockMt);
        let tts: Arc<dyn TtsAdapter> = Arc::new(MockTts { sample_rate: 24_000 });

        let (mut orch, mut events) = Orchestrator::spawn(config, asr, mt, tts);
        orch.append_audio(&vec![1000i16; 4_000]);

        let mut saw_committed = false;
        let mut saw_tts_chunk = false;
        let mut saw_tts_end = false;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Some(PipelineEvent::CommittedTranscript { .. })) => saw_committed = true,
                Ok(Some(PipelineEvent::TtsAudioChunk { .. })) => saw_tts_chunk = true,
                Ok(Some(PipelineEvent::TtsEnd { .. })) => {
                    saw_tts_end = true;
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        orch.stop().await;
        assert!(saw_committed, "expected a committed_transcript event");
        assert!(saw_tts_chunk, "expected at least one tts audio chunk");
        assert!(saw_tts_end, "expected a tts_end event");
    }

    #[test]
    fn hallucination_denylist_matches_case_insensitively() {
        let denylist = vec!["subscribe".to_string()];
        assert!(is_hallucination("Subscribe", &denylist));
        assert!(is_hallucination("  SUBSCRIBE  ", &denylist));
        assert!(!is_hallucination("hello there", &denylist));
    }

    #[test]
    fn repetition_gate_flags_looping_output() {
        let looping = "the cat sat the cat sat the cat sat the cat sat";
        assert!(repeated_ngram_ratio(looping, 3) > 0.5);
        assert_eq!(repeated_ngram_ratio("a perfectly normal sentence here", 3), 0.0);
    }
}
