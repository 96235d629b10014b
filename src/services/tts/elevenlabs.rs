use crate::core::error::TtsError;
use crate::core::state::WordTimestamp;
use crate::services::tts::{
    ApiKeyStatus, RateLimitInfo, SynthesisRequest, SynthesisResponse, TtsClient,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

const API_KEY_HEADER: &str = "xi-api-key";
const RATELIMIT_REMAINING: &str = "ratelimit-remaining";
const RATELIMIT_RESET: &str = "ratelimit-reset";

pub struct ElevenLabsClient {
    client: Client,
    base_url: Url,
    api_key: String,
}

#[derive(Deserialize)]
struct TimestampedAudio {
    audio_base64: String,
    #[serde(default)]
    alignment: Option<Alignment>,
    #[serde(default)]
    normalized_alignment: Option<Alignment>,
}

/// Timing data as returned by the with-timestamps endpoint. Either the word
/// arrays or the character arrays may be populated.
#[derive(Deserialize, Default, Debug)]
pub(crate) struct Alignment {
    #[serde(default)]
    characters: Vec<String>,
    #[serde(default)]
    character_start_times_seconds: Vec<f64>,
    #[serde(default)]
    character_end_times_seconds: Vec<f64>,
    #[serde(default)]
    words: Vec<String>,
    #[serde(default)]
    word_start_times_seconds: Vec<f64>,
    #[serde(default)]
    word_end_times_seconds: Vec<f64>,
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}

impl Alignment {
    pub(crate) fn to_words(&self) -> Option<Vec<WordTimestamp>> {
        let words = if !self.word_start_times_seconds.is_empty() {
            self.word_level()
        } else {
            self.character_level()
        };
        if words.is_empty() {
            None
        } else {
            Some(words)
        }
    }

    fn word_level(&self) -> Vec<WordTimestamp> {
        self.word_start_times_seconds
            .iter()
            .zip(&self.word_end_times_seconds)
            .enumerate()
            .map(|(i, (start, end))| WordTimestamp {
                word: self.words.get(i).cloned().unwrap_or_default(),
                start_ms: seconds_to_ms(*start),
                end_ms: seconds_to_ms(*end),
            })
            .collect()
    }

    /// Groups characters between whitespace into words.
    fn character_level(&self) -> Vec<WordTimestamp> {
        let mut words = Vec::new();
        let mut current: Option<WordTimestamp> = None;

        let timed = self
            .characters
            .iter()
            .zip(&self.character_start_times_seconds)
            .zip(&self.character_end_times_seconds);
        for ((ch, start), end) in timed {
            if ch.trim().is_empty() {
                if let Some(word) = current.take() {
                    words.push(word);
                }
                continue;
            }
            match current.as_mut() {
                Some(word) => {
                    word.word.push_str(ch);
                    word.end_ms = seconds_to_ms(*end);
                }
                None => {
                    current = Some(WordTimestamp {
                        word: ch.clone(),
                        start_ms: seconds_to_ms(*start),
                        end_ms: seconds_to_ms(*end),
                    })
                }
            }
        }
        if let Some(word) = current {
            words.push(word);
        }
        words
    }
}

/// Reads quota headers. Small reset values are treated as seconds from now,
/// larger ones as a Unix timestamp.
pub(crate) fn parse_rate_limit(headers: &HeaderMap, now: DateTime<Utc>) -> RateLimitInfo {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    };

    let remaining = header(RATELIMIT_REMAINING).and_then(|v| v.parse::<u32>().ok());
    let reset_at = header(RATELIMIT_RESET)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .and_then(|v| {
            if v < 1_000_000_000.0 {
                TimeDelta::try_milliseconds((v * 1000.0) as i64)
                    .and_then(|delta| now.checked_add_signed(delta))
            } else {
                DateTime::from_timestamp(v as i64, 0)
            }
        });

    RateLimitInfo {
        remaining,
        reset_at,
    }
}

/// Best-effort message from an error body: JSON `detail`, else raw text.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match &value["detail"] {
            Value::String(s) => return s.clone(),
            Value::Object(detail) => {
                if let Some(message) = detail.get("message").and_then(Value::as_str) {
                    return message.to_string();
                }
            }
            _ => {}
        }
    }
    body.trim().to_string()
}

async fn http_error(resp: Response) -> TtsError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    TtsError::Http {
        status,
        message: error_message(&body),
    }
}

impl ElevenLabsClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("Invalid API base URL {}", base_url))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TtsError> {
        self.base_url
            .join(path)
            .map_err(|e| TtsError::InvalidResponse(format!("bad endpoint {}: {}", path, e)))
    }

    /// `v1/text-to-speech/{voice_id}[/suffix]`, with the voice id escaped as one segment.
    fn voice_endpoint(&self, voice_id: &str, suffix: Option<&str>) -> Result<Url, TtsError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                TtsError::InvalidResponse(format!("base URL {} cannot hold a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(["v1", "text-to-speech", voice_id])
            .extend(suffix);
        Ok(url)
    }

    fn request_body(request: &SynthesisRequest) -> Value {
        let mut body = json!({
            "text": request.text,
            "model_id": request.model_id,
            "output_format": request.output_format,
            "voice_settings": {
                "stability": request.voice_settings.stability,
                "similarity_boost": request.voice_settings.similarity_boost,
                "style": request.voice_settings.style,
                "speed": request.voice_settings.speed,
                "use_speaker_boost": true,
            },
        });
        if let Some(code) = &request.language_code {
            body["language_code"] = json!(code);
        }
        body
    }
}

#[async_trait]
impl TtsClient for ElevenLabsClient {
    fn api_key(&self) -> &str {
        &self.api_key
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse, TtsError> {
        let url = self.voice_endpoint(&request.voice_id, Some("with-timestamps"))?;
        debug!("POST {} ({} chars)", url, request.text.len());

        let resp = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header("Accept", "application/json")
            .json(&Self::request_body(request))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(http_error(resp).await);
        }

        let rate_limit = parse_rate_limit(resp.headers(), Utc::now());
        let body = resp.text().await?;
        let payload: TimestampedAudio = serde_json::from_str(&body)
            .map_err(|e| TtsError::InvalidResponse(format!("bad JSON: {}", e)))?;
        let audio = STANDARD
            .decode(payload.audio_base64.trim())
            .map_err(|e| TtsError::InvalidResponse(format!("bad audio payload: {}", e)))?;
        let words = payload
            .normalized_alignment
            .as_ref()
            .and_then(Alignment::to_words)
            .or_else(|| payload.alignment.as_ref().and_then(Alignment::to_words));

        Ok(SynthesisResponse {
            audio,
            words,
            rate_limit,
        })
    }

    async fn synthesize_preview(&self, request: &SynthesisRequest) -> Result<Vec<u8>, TtsError> {
        let url = self.voice_endpoint(&request.voice_id, None)?;
        let resp = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&Self::request_body(request))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(http_error(resp).await);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn validate_api_key(&self) -> Result<ApiKeyStatus, TtsError> {
        let url = self.endpoint("v1/user/subscription")?;
        let resp = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(ApiKeyStatus {
                valid: true,
                status: Some(status.as_u16()),
                message: None,
            });
        }

        let body = resp.text().await.unwrap_or_default();
        Ok(ApiKeyStatus {
            valid: false,
            status: Some(status.as_u16()),
            message: Some(error_message(&body)).filter(|m| !m.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::VoiceSettings;
    use mockito::Matcher;
    use reqwest::header::HeaderValue;

    fn request(voice_id: &str) -> SynthesisRequest {
        SynthesisRequest {
            voice_id: voice_id.to_string(),
            text: "Hello there.".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            output_format: "mp3_44100_128".to_string(),
            voice_settings: VoiceSettings::default(),
            language_code: None,
        }
    }

    fn client(url: &str) -> ElevenLabsClient {
        ElevenLabsClient::new(url, "test_key", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_synthesize_decodes_audio_and_alignment() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/text-to-speech/voice123/with-timestamps")
            .match_header("xi-api-key", "test_key")
            .match_body(Matcher::PartialJson(json!({
                "text": "Hello there.",
                "model_id": "eleven_multilingual_v2",
                "output_format": "mp3_44100_128",
                "voice_settings": { "use_speaker_boost": true }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("ratelimit-remaining", "42")
            .with_header("ratelimit-reset", "4102444800")
            .with_body(
                json!({
                    "audio_base64": STANDARD.encode(b"ID3audio"),
                    "normalized_alignment": {
                        "words": ["Hello", "there."],
                        "word_start_times_seconds": [0.1, 0.6],
                        "word_end_times_seconds": [0.5, 1.25]
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let resp = client(&server.url())
            .synthesize(&request("voice123"))
            .await
            .unwrap();

        assert_eq!(resp.audio, b"ID3audio");
        assert_eq!(resp.start_time_ms(), Some(100));
        assert_eq!(resp.end_time_ms(), Some(1250));
        assert_eq!(resp.words.as_ref().unwrap()[1].word, "there.");
        assert_eq!(resp.rate_limit.remaining, Some(42));
        assert_eq!(
            resp.rate_limit.reset_at,
            DateTime::from_timestamp(4_102_444_800, 0)
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_synthesize_surfaces_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _unauthorized = server
            .mock("POST", "/v1/text-to-speech/bad/with-timestamps")
            .with_status(401)
            .with_body(r#"{"detail":{"status":"invalid_api_key","message":"Invalid API key"}}"#)
            .create_async()
            .await;
        let _overloaded = server
            .mock("POST", "/v1/text-to-speech/busy/with-timestamps")
            .with_status(503)
            .with_body("upstream overloaded")
            .create_async()
            .await;

        let client = client(&server.url());

        let err = client.synthesize(&request("bad")).await.unwrap_err();
        assert_eq!(
            err,
            TtsError::Http {
                status: 401,
                message: "Invalid API key".to_string()
            }
        );
        assert!(!err.is_retryable());

        let err = client.synthesize(&request("busy")).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_synthesize_rejects_garbage_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/text-to-speech/v/with-timestamps")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let err = client(&server.url()).synthesize(&request("v")).await.unwrap_err();
        assert!(matches!(err, TtsError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_preview_returns_raw_audio() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/text-to-speech/voice123")
            .match_header("accept", "audio/mpeg")
            .with_status(200)
            .with_header("content-type", "audio/mpeg")
            .with_body(b"raw-mp3-bytes")
            .create_async()
            .await;

        let audio = client(&server.url())
            .synthesize_preview(&request("voice123"))
            .await
            .unwrap();
        assert_eq!(audio, b"raw-mp3-bytes");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_validate_api_key() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server
            .mock("GET", "/v1/user/subscription")
            .match_header("xi-api-key", "test_key")
            .with_status(200)
            .with_body(r#"{"tier":"starter"}"#)
            .create_async()
            .await;
        let status = client(&server.url()).validate_api_key().await.unwrap();
        assert!(status.valid);

        let mut server = mockito::Server::new_async().await;
        let _denied = server
            .mock("GET", "/v1/user/subscription")
            .with_status(401)
            .with_body(r#"{"detail":"Unauthorized"}"#)
            .create_async()
            .await;
        let status = client(&server.url()).validate_api_key().await.unwrap();
        assert_eq!(
            status,
            ApiKeyStatus {
                valid: false,
                status: Some(401),
                message: Some("Unauthorized".to_string())
            }
        );
    }

    #[test]
    fn test_words_from_character_alignment() {
        let alignment = Alignment {
            characters: ["H", "i", " ", "y", "o", "u"].iter().map(|s| s.to_string()).collect(),
            character_start_times_seconds: vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5],
            character_end_times_seconds: vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
            ..Default::default()
        };
        let words = alignment.to_words().unwrap();
        assert_eq!(
            words,
            vec![
                WordTimestamp {
                    word: "Hi".to_string(),
                    start_ms: 0,
                    end_ms: 200
                },
                WordTimestamp {
                    word: "you".to_string(),
                    start_ms: 300,
                    end_ms: 600
                },
            ]
        );
        assert!(Alignment::default().to_words().is_none());
    }

    #[test]
    fn test_parse_rate_limit_headers() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from_static("3"));
        headers.insert(RATELIMIT_RESET, HeaderValue::from_static("30"));
        let info = parse_rate_limit(&headers, now);
        assert_eq!(info.remaining, Some(3));
        assert_eq!(info.reset_at, Some(now + chrono::Duration::seconds(30)));

        let empty = parse_rate_limit(&HeaderMap::new(), now);
        assert_eq!(empty, RateLimitInfo::default());
    }

    #[test]
    fn test_parse_rate_limit_ignores_unusable_reset() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for reset in ["-1e300", "-1e13", "-5", "NaN", "inf", "1e300"] {
            let mut headers = HeaderMap::new();
            headers.insert(RATELIMIT_REMAINING, HeaderValue::from_static("7"));
            headers.insert(RATELIMIT_RESET, HeaderValue::from_str(reset).unwrap());
            let info = parse_rate_limit(&headers, now);
            assert_eq!(info.remaining, Some(7), "reset {}", reset);
            assert_eq!(info.reset_at, None, "reset {}", reset);
        }

        let mut headers = HeaderMap::new();
        headers.insert(RATELIMIT_RESET, HeaderValue::from_static("1700000060"));
        assert_eq!(
            parse_rate_limit(&headers, now).reset_at,
            DateTime::from_timestamp(1_700_000_060, 0)
        );
    }

    #[test]
    fn test_voice_id_is_escaped_in_path() {
        let client = client("https://api.example.com/base");
        let url = client.voice_endpoint("a/b?c", Some("with-timestamps")).unwrap();
        assert_eq!(url.path(), "/base/v1/text-to-speech/a%2Fb%3Fc/with-timestamps");
        assert_eq!(url.query(), None);

        let url = client.voice_endpoint("voice123", None).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/base/v1/text-to-speech/voice123");
    }

    #[test]
    fn test_error_message_fallbacks() {
        assert_eq!(error_message(r#"{"detail":"nope"}"#), "nope");
        assert_eq!(error_message(r#"{"detail":{"message":"bad voice"}}"#), "bad voice");
        assert_eq!(error_message(" plain text \n"), "plain text");
    }
}
