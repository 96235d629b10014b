use crate::core::config::Config;
use crate::core::error::TtsError;
use crate::core::state::{VoiceSettings, WordTimestamp};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

pub mod elevenlabs;

/// Everything needed to synthesize one line of dialogue.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub voice_id: String,
    pub text: String,
    pub model_id: String,
    pub output_format: String,
    pub voice_settings: VoiceSettings,
    pub language_code: Option<String>,
}

/// Quota information read from response headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResponse {
    pub audio: Vec<u8>,
    pub words: Option<Vec<WordTimestamp>>,
    pub rate_limit: RateLimitInfo,
}

impl SynthesisResponse {
    pub fn start_time_ms(&self) -> Option<u64> {
        self.words.as_ref()?.first().map(|w| w.start_ms)
    }

    pub fn end_time_ms(&self) -> Option<u64> {
        self.words.as_ref()?.last().map(|w| w.end_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKeyStatus {
    pub valid: bool,
    pub status: Option<u16>,
    pub message: Option<String>,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    fn api_key(&self) -> &str;

    /// Synthesizes one line and returns audio plus word timings when available.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse, TtsError>;

    /// Plain audio without timing data.
    async fn synthesize_preview(&self, request: &SynthesisRequest) -> Result<Vec<u8>, TtsError>;

    async fn validate_api_key(&self) -> Result<ApiKeyStatus, TtsError>;
}

pub fn create_tts_client(config: &Config, api_key: &str) -> Result<Box<dyn TtsClient>> {
    info!("Initializing TTS client for {}", config.api.base_url);
    Ok(Box::new(elevenlabs::ElevenLabsClient::new(
        &config.api.base_url,
        api_key,
        std::time::Duration::from_secs(config.api.request_timeout_seconds),
    )?))
}
