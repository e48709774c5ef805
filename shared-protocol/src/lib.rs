use serde::{Deserialize, Serialize};

/// Inbound audio is always PCM16 little-endian mono at this rate.
pub const INBOUND_SAMPLE_RATE: u32 = 16_000;
/// Outbound synthesized audio is always PCM16 mono at this rate.
pub const OUTBOUND_SAMPLE_RATE: u32 = 24_000;

/// Frames a client may send over `/ws/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first frame; a second one fails the session.
    Config {
        source_lang: String,
        target_lang: String,
    },
    /// Base64-encoded PCM16 audio chunk. `seq` is informational only;
    /// arrival order on the stream is what the buffer trusts.
    Audio {
        seq: u64,
        sample_rate: u32,
        pcm16_base64: String,
    },
    /// Flush: force a final commit, drain TTS, then close.
    Stop,
}

/// Events emitted to the client over `/ws/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        message: String,
    },
    Ready,
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
        audio_b64: String,
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
    },
}

/// Tunable knobs, overridable per-session and populated server-wide from
/// environment/CLI configuration (see §6 of the spec).
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub window_seconds: f32,
    pub asr_interval_ms: u64,
    pub commit_stability_k: usize,
    pub commit_timeout_seconds: f32,
    pub commit_min_words: usize,
    pub buffer_limit_ms: u64,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            window_seconds: 8.0,
            asr_interval_ms: 500,
            commit_stability_k: 3,
            commit_timeout_seconds: 2.0,
            commit_min_words: 1,
            buffer_limit_ms: 3_000,
        }
    }
}

/// Per-session negotiated configuration. Set exactly once, before audio is
/// accepted, and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub source_lang: String,
    pub target_lang: String,
    pub window_seconds: f32,
    pub asr_interval_ms: u64,
    pub commit_stability_k: usize,
    pub commit_timeout_seconds: f32,
    pub commit_min_words: usize,
    pub buffer_limit_ms: u64,
}

impl SessionConfig {
    pub fn new(source_lang: String, target_lang: String, defaults: &SessionDefaults) -> Self {
        Self {
            source_lang,
            target_lang,
            window_seconds: defaults.window_seconds,
            asr_interval_ms: defaults.asr_interval_ms,
            commit_stability_k: defaults.commit_stability_k,
            commit_timeout_seconds: defaults.commit_timeout_seconds,
            commit_min_words: defaults.commit_min_words,
            buffer_limit_ms: defaults.buffer_limit_ms,
        }
    }
}

/// One full transcription of the current audio window, produced by the ASR
/// worker and consumed once by the commit tracker.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub text: String,
    pub emitted_at: std::time::Instant,
}

/// A unit of irrevocably-committed text that flows through MT and TTS.
/// Segments are independent of each other once emitted.
#[derive(Debug, Clone)]
pub struct Segment {
    pub segment_id: u64,
    pub source_text: String,
    pub t_commit: std::time::Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_frame_round_trips() {
        let msg = ClientMessage::Config {
            source_lang: "en".to_string(),
            target_lang: "es".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"config\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::Config {
                source_lang,
                target_lang,
            } => {
                assert_eq!(source_lang, "en");
                assert_eq!(target_lang, "es");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn audio_frame_parses() {
        let json = r#"{"type":"audio","seq":1,"sample_rate":16000,"pcm16_base64":"AAA="}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Audio {
                seq: 1,
                sample_rate: 16000,
                ..
            }
        ));
    }

    #[test]
    fn error_event_serializes_with_tag() {
        let msg = ServerMessage::Error {
            message: "boom".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"boom"}"#);
    }
}
