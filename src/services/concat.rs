use crate::core::config::ProductionConfig;
use crate::core::state::GeneratedBlob;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioAsset {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundTrack {
    pub asset: AudioAsset,
    pub volume: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoundEffect {
    pub asset: AudioAsset,
    pub start_time_ms: u64,
    pub volume: f32,
}

/// Audio layered under the dialogue when the service mixes the final track.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProductionMetadata {
    pub background_track: Option<BackgroundTrack>,
    pub sound_effects: Vec<SoundEffect>,
}

async fn load_asset(path: &str) -> Result<AudioAsset> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read audio asset {}", path))?;
    let filename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    Ok(AudioAsset { filename, data })
}

impl ProductionMetadata {
    pub async fn load(config: &ProductionConfig) -> Result<Self> {
        let background_track = match &config.background_track {
            Some(track) => Some(BackgroundTrack {
                asset: load_asset(&track.path).await?,
                volume: track.volume,
            }),
            None => None,
        };

        let mut sound_effects = Vec::with_capacity(config.sound_effects.len());
        for effect in &config.sound_effects {
            sound_effects.push(SoundEffect {
                asset: load_asset(&effect.path).await?,
                start_time_ms: effect.start_time_ms,
                volume: effect.volume,
            });
        }

        Ok(Self {
            background_track,
            sound_effects,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.background_track.is_none() && self.sound_effects.is_empty()
    }

    /// Mix description referencing the uploaded assets by form field name.
    pub fn mix_config(&self) -> Value {
        let effects: Vec<Value> = self
            .sound_effects
            .iter()
            .enumerate()
            .map(|(i, effect)| {
                json!({
                    "field": sound_effect_field(i),
                    "startTimeMs": effect.start_time_ms,
                    "volume": effect.volume,
                })
            })
            .collect();

        json!({
            "backgroundTrack": self.background_track.as_ref().map(|track| json!({
                "field": BACKGROUND_FIELD,
                "volume": track.volume,
            })),
            "soundEffects": effects,
        })
    }
}

const AUDIO_FILES_FIELD: &str = "audioFiles";
const BACKGROUND_FIELD: &str = "backgroundTrack";

fn sound_effect_field(index: usize) -> String {
    format!("soundEffect_{}", index)
}

fn mime_for(filename: &str) -> &'static str {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") | Some("opus") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn file_part(filename: &str, data: &[u8]) -> Result<Part> {
    Part::bytes(data.to_vec())
        .file_name(filename.to_string())
        .mime_str(mime_for(filename))
        .context("Invalid mime type")
}

/// Server-side joining and mixing of per-chunk audio.
#[async_trait]
pub trait Concatenator: Send + Sync {
    async fn concatenate(
        &self,
        blobs: &[GeneratedBlob],
        production: Option<&ProductionMetadata>,
        output_format: &str,
    ) -> Result<Vec<u8>>;

    async fn health(&self) -> Result<bool>;
}

pub struct HttpConcatClient {
    client: Client,
    base_url: Url,
}

impl HttpConcatClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to build HTTP client")?,
            base_url: Url::parse(&base)
                .with_context(|| format!("Invalid concatenation URL {}", base_url))?,
        })
    }
}

#[async_trait]
impl Concatenator for HttpConcatClient {
    async fn concatenate(
        &self,
        blobs: &[GeneratedBlob],
        production: Option<&ProductionMetadata>,
        output_format: &str,
    ) -> Result<Vec<u8>> {
        let mut form = Form::new().text("outputFormat", output_format.to_string());
        for blob in blobs {
            form = form.part(AUDIO_FILES_FIELD, file_part(&blob.filename, &blob.blob)?);
        }

        if let Some(production) = production.filter(|p| !p.is_empty()) {
            form = form.text("mixConfig", production.mix_config().to_string());
            if let Some(track) = &production.background_track {
                form = form.part(
                    BACKGROUND_FIELD,
                    file_part(&track.asset.filename, &track.asset.data)?,
                );
            }
            for (i, effect) in production.sound_effects.iter().enumerate() {
                form = form.part(
                    sound_effect_field(i),
                    file_part(&effect.asset.filename, &effect.asset.data)?,
                );
            }
        }

        let url = self.base_url.join("concatenate")?;
        info!("Requesting concatenation of {} files", blobs.len());
        let resp = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .context("Failed to send concatenation request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or(body);
            return Err(anyhow!("Concatenation failed (HTTP {}): {}", status.as_u16(), message));
        }

        let audio = resp.bytes().await.context("Failed to read concatenated audio")?;
        debug!("Concatenated audio: {} bytes", audio.len());
        Ok(audio.to_vec())
    }

    async fn health(&self) -> Result<bool> {
        let url = self.base_url.join("health")?;
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(body["status"] == "ok")
    }
}
