//! Narrow capability contracts for the ASR/MT/TTS model backends (§6).
//!
//! Real model bindings are out of scope for this crate; each trait is the
//! seam a binding would implement. `mock` ships deterministic stand-ins
//! used by this crate's own tests and by `server`'s integration tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// `transcribe(samples_f32, sample_rate, language_code) -> text`.
#[async_trait]
pub trait AsrAdapter: Send + Sync {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
        language: &str,
    ) -> anyhow::Result<String>;
}

/// `translate(text, source_lang, target_lang) -> text`.
#[async_trait]
pub trait MtAdapter: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> anyhow::Result<String>;
}

/// One chunk of a streaming TTS synthesis: raw PCM16 at 24 kHz mono.
pub type TtsChunkSamples = Vec<i16>;

/// `synthesize_streaming(text, voice_config) -> lazy sequence of PCM16
/// chunks`. The returned stream is finite and terminates with an end
/// marker (the stream simply ending).
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    async fn synthesize_streaming(
        &self,
        text: &str,
        voice_config: &str,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<TtsChunkSamples>>>;
}

/// Deterministic mock adapters for tests. Not wired into the production
/// binary by default.
#[cfg(any(test, feature = "mock-adapters"))]
pub mod mock {
    use super::*;
    use futures_util::stream;

    pub struct MockAsr {
        pub fixed_reply: String,
    }

    #[async_trait]
    impl AsrAdapter for MockAsr {
        async fn transcribe(
            &self,
            _samples: &[f32],
            _sample_rate: u32,
            _language: &str,
        ) -> anyhow::Result<String> {
            Ok(self.fixed_reply.clone())
        }
    }

    pub struct MockMt;

    #[async_trait]
    impl MtAdapter for MockMt {
        async fn translate(
            &self,
            text: &str,
            _source_lang: &str,
            target_lang: &str,
        ) -> anyhow::Result<String> {
            Ok(format!("[{target_lang}] {text}"))
        }
    }

    /// Synthesizes silence: one 20ms chunk per four characters of text.
    pub struct MockTts {
        pub sample_rate: u32,
    }

    #[async_trait]
    impl TtsAdapter for MockTts {
        async fn synthesize_streaming(
            &self,
            text: &str,
            _voice_config: &str,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<TtsChunkSamples>>> {
            let chunk_samples = (self.sample_rate / 50) as usize; // 20ms
            let n_chunks = (text.chars().count() / 4).max(1);
            let chunks: Vec<anyhow::Result<TtsChunkSamples>> = (0..n_chunks)
                .map(|_| Ok(vec![0i16; chunk_samples]))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn mock_asr_returns_fixed_reply() {
        let asr = MockAsr {
            fixed_reply: "hola".to_string(),
        };
        let out = asr.transcribe(&[0.0; 100], 16_000, "es").await.unwrap();
        assert_eq!(out, "hola");
    }

    #[tokio::test]
    async fn mock_mt_tags_target_language() {
        let mt = MockMt;
        let out = mt.translate("hola", "es", "en").await.unwrap();
        assert_eq!(out, "[en] hola");
    }

    #[tokio::test]
    async fn mock_tts_emits_at_least_one_chunk() {
        let tts = MockTts { sample_rate: 24_000 };
        let mut stream = tts.synthesize_streaming("hello there", "default").await.unwrap();
        let mut count = 0;
        while let Some(chunk) = stream.next().await {
            assert!(chunk.unwrap().len() > 0);
            count += 1;
        }
        assert!(count >= 1);
    }
}
