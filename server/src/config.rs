//! Server-wide configuration: environment keys recognized per §6, with CLI
//! flags taking precedence and built-in defaults underneath both.

use std::time::Duration;
use tracing::warn;

const ENV_PREFIX: &str = "S2ST_";

const KNOWN_KEYS: &[&str] = &[
    "S2ST_DEVICE",
    "S2ST_ASR_MODEL",
    "S2ST_MT_MODEL",
    "S2ST_TTS_MODEL",
    "S2ST_WINDOW_SECONDS",
    "S2ST_ASR_INTERVAL_MS",
    "S2ST_COMMIT_STABILITY_K",
    "S2ST_COMMIT_TIMEOUT_SECONDS",
    "S2ST_COMMIT_MIN_WORDS",
    "S2ST_BUFFER_LIMIT_MS",
    "S2ST_CAPTURE_SAMPLE_RATE",
    "S2ST_LOG_LEVEL",
    "S2ST_BIND_HOST",
    "S2ST_BIND_PORT",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Device selector and model identifiers are accepted and logged but
    /// otherwise inert here: model selection is out of scope (§1).
    pub device: String,
    pub asr_model: String,
    pub mt_model: String,
    pub tts_model: String,

    pub window_seconds: f32,
    pub asr_interval_ms: u64,
    pub commit_stability_k: usize,
    pub commit_timeout_seconds: f32,
    pub commit_min_words: usize,
    pub buffer_limit_ms: u64,
    pub capture_sample_rate: u32,

    pub log_level: String,
    pub bind_host: String,
    pub bind_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = shared_protocol::SessionDefaults::default();
        Self {
            device: "cpu".to_string(),
            asr_model: "unspecified".to_string(),
            mt_model: "unspecified".to_string(),
            tts_model: "unspecified".to_string(),
            window_seconds: defaults.window_seconds,
            asr_interval_ms: defaults.asr_interval_ms,
            commit_stability_k: defaults.commit_stability_k,
            commit_timeout_seconds: defaults.commit_timeout_seconds,
            commit_min_words: defaults.commit_min_words,
            buffer_limit_ms: defaults.buffer_limit_ms,
            capture_sample_rate: shared_protocol::INBOUND_SAMPLE_RATE,
            log_level: "info".to_string(),
            bind_host: "[::]".to_string(),
            bind_port: 8001,
        }
    }
}

impl ServerConfig {
    /// Reads recognized `S2ST_*` environment keys over the built-in
    /// defaults. Unknown `S2ST_*` keys are logged once as a warning and
    /// otherwise ignored, per §6.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        macro_rules! parse_env {
            ($key:expr, $field:expr, $parse:expr) => {
                if let Ok(raw) = std::env::var($key) {
                    match $parse(raw.as_str()) {
                        Ok(v) => $field = v,
                        Err(e) => warn!(key = $key, value = raw, error = %e, "ignoring unparseable config value"),
                    }
                }
            };
        }

        if let Ok(v) = std::env::var("S2ST_DEVICE") {
            config.device = v;
        }
        if let Ok(v) = std::env::var("S2ST_ASR_MODEL") {
            config.asr_model = v;
        }
        if let Ok(v) = std::env::var("S2ST_MT_MODEL") {
            config.mt_model = v;
        }
        if let Ok(v) = std::env::var("S2ST_TTS_MODEL") {
            config.tts_model = v;
        }
        if let Ok(v) = std::env::var("S2ST_LOG_LEVEL") {
            config.log_level = v;
        }
        if let Ok(v) = std::env::var("S2ST_BIND_HOST") {
            config.bind_host = v;
        }

        parse_env!("S2ST_WINDOW_SECONDS", config.window_seconds, |s: &str| s.parse::<f32>());
        parse_env!("S2ST_ASR_INTERVAL_MS", config.asr_interval_ms, |s: &str| s.parse::<u64>());
        parse_env!("S2ST_COMMIT_STABILITY_K", config.commit_stability_k, |s: &str| s.parse::<usize>());
        parse_env!("S2ST_COMMIT_TIMEOUT_SECONDS", config.commit_timeout_seconds, |s: &str| s.parse::<f32>());
        parse_env!("S2ST_COMMIT_MIN_WORDS", config.commit_min_words, |s: &str| s.parse::<usize>());
        parse_env!("S2ST_BUFFER_LIMIT_MS", config.buffer_limit_ms, |s: &str| s.parse::<u64>());
        parse_env!("S2ST_CAPTURE_SAMPLE_RATE", config.capture_sample_rate, |s: &str| s.parse::<u32>());
        parse_env!("S2ST_BIND_PORT", config.bind_port, |s: &str| s.parse::<u16>());

        for (key, _) in std::env::vars() {
            if key.starts_with(ENV_PREFIX) && !KNOWN_KEYS.contains(&key.as_str()) {
                warn!(key = %key, "unrecognized S2ST_ configuration key, ignoring");
            }
        }

        config
    }

    pub fn asr_call_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    pub fn mt_call_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    pub fn tts_call_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_session_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.commit_stability_k, 3);
        assert_eq!(config.buffer_limit_ms, 3_000);
    }

    #[test]
    fn env_override_takes_effect() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("S2ST_COMMIT_STABILITY_K", "5");
        }
        let config = ServerConfig::from_env();
        assert_eq!(config.commit_stability_k, 5);
        unsafe {
            std::env::remove_var("S2ST_COMMIT_STABILITY_K");
        }
    }

    #[test]
    fn unparseable_value_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("S2ST_BUFFER_LIMIT_MS", "not-a-number");
        }
        let config = ServerConfig::from_env();
        assert_eq!(config.buffer_limit_ms, 3_000);
        unsafe {
            std::env::remove_var("S2ST_BUFFER_LIMIT_MS");
        }
    }
}
