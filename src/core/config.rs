use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::state::CharacterConfigs;

pub const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_state")]
    pub state_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_user_id")]
    pub user_id: String,

    #[serde(default)]
    pub unattended: bool,

    #[serde(default = "default_progress_ttl_hours")]
    pub progress_ttl_hours: u64,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub concat: ConcatConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConcatConfig {
    #[serde(default = "default_concat_base_url")]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Log a warning when fewer requests than this remain.
    #[serde(default = "default_warn_below")]
    pub warn_below: u32,
    /// Wait for the reset time when fewer requests than this remain.
    #[serde(default = "default_pause_below")]
    pub pause_below: u32,
}

/// Per-project generation settings, stored alongside resumable progress.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub concatenate: bool,
    #[serde(default)]
    pub speak_parentheticals: bool,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

/// Project file consumed by the CLI.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub character_configs: CharacterConfigs,
    #[serde(default)]
    pub project_settings: ProjectSettings,
    #[serde(default)]
    pub production: Option<ProductionConfig>,
}

/// Background music and sound effects referenced by file path.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProductionConfig {
    pub background_track: Option<TrackRef>,
    #[serde(default)]
    pub sound_effects: Vec<SoundEffectRef>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TrackRef {
    pub path: String,
    #[serde(default = "default_background_volume")]
    pub volume: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SoundEffectRef {
    pub path: String,
    pub start_time_ms: u64,
    #[serde(default = "default_effect_volume")]
    pub volume: f32,
}

fn default_state() -> String {
    "state".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_user_id() -> String {
    "default".to_string()
}
fn default_progress_ttl_hours() -> u64 {
    24
}
fn default_true() -> bool {
    true
}
fn default_api_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_request_timeout_seconds() -> u64 {
    120
}
fn default_concat_base_url() -> String {
    "http://127.0.0.1:3001".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_jitter_ms() -> u64 {
    1000
}
fn default_warn_below() -> u32 {
    10
}
fn default_pause_below() -> u32 {
    5
}
fn default_model_id() -> String {
    "eleven_multilingual_v2".to_string()
}
fn default_output_format() -> String {
    "mp3_44100_128".to_string()
}
fn default_request_delay_ms() -> u64 {
    500
}
fn default_background_volume() -> f32 {
    0.3
}
fn default_effect_volume() -> f32 {
    1.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_folder: default_state(),
            output_folder: default_output(),
            user_id: default_user_id(),
            unattended: false,
            progress_ttl_hours: default_progress_ttl_hours(),
            api: ApiConfig::default(),
            concat: ConcatConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            api_key: None,
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl Default for ConcatConfig {
    fn default() -> Self {
        Self {
            base_url: default_concat_base_url(),
            enabled: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff before the retry that follows failed attempt `attempt` (0-based):
    /// `base * 2^attempt + random(0..=max_jitter)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let exponential = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter = if self.max_jitter_ms > 0 {
            rand::rng().random_range(0..=self.max_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(exponential.saturating_add(jitter))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            warn_below: default_warn_below(),
            pause_below: default_pause_below(),
        }
    }
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            output_format: default_output_format(),
            concatenate: false,
            speak_parentheticals: false,
            language_code: None,
            request_delay_ms: default_request_delay_ms(),
        }
    }
}

impl ProjectSettings {
    /// File extension implied by the output format, e.g. `mp3_44100_128` -> `mp3`.
    pub fn file_extension(&self) -> &str {
        match self.output_format.split('_').next() {
            Some(ext) if !ext.is_empty() => ext,
            _ => "mp3",
        }
    }
}

impl Config {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from(path)
        } else {
            log::info!("{} not found, using defaults", path.as_ref().display());
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.state_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }

    /// Flag value first, then the environment, then the config file.
    pub fn resolve_api_key(&self, flag: Option<&str>) -> Option<String> {
        first_usable_key([
            flag.map(str::to_string),
            std::env::var(API_KEY_ENV).ok(),
            self.api.api_key.clone(),
        ])
    }
}

/// First source holding a non-blank key.
fn first_usable_key(sources: [Option<String>; 3]) -> Option<String> {
    sources
        .into_iter()
        .flatten()
        .find(|k| !k.trim().is_empty())
}

impl ProjectConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read project config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse project config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "user_id: alice\nretry:\n  max_attempts: 5\n";
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.rate_limit.pause_below, 5);
        assert_eq!(config.api.base_url, "https://api.elevenlabs.io");
        assert_eq!(config.progress_ttl_hours, 24);
    }

    #[test]
    fn test_config_save_and_load() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.output_folder = "renders".to_string();
        config.save_to(&path)?;

        let loaded = Config::load_from(&path)?;
        assert_eq!(loaded.output_folder, "renders");
        assert!(Config::load_from(temp_dir.path().join("missing.yml")).is_err());
        assert_eq!(
            Config::load_or_default(temp_dir.path().join("missing.yml"))?.user_id,
            "default"
        );
        Ok(())
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 0,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(1), Duration::from_millis(2000));
        assert_eq!(retry.delay_for(2), Duration::from_millis(4000));

        let jittered = RetryConfig {
            max_jitter_ms: 1000,
            ..retry
        };
        let d = jittered.delay_for(1);
        assert!(d >= Duration::from_millis(2000) && d <= Duration::from_millis(3000));
    }

    #[test]
    fn test_project_config_json() {
        let json = r#"{
            "characterConfigs": { "JOHN": { "voiceId": "v1" } },
            "projectSettings": { "concatenate": true, "outputFormat": "pcm_24000" },
            "production": {
                "backgroundTrack": { "path": "music.mp3" },
                "soundEffects": [ { "path": "door.mp3", "startTimeMs": 1500 } ]
            }
        }"#;
        let project: ProjectConfig = serde_json::from_str(json).unwrap();
        assert_eq!(project.character_configs["JOHN"].voice_id, "v1");
        assert!(project.project_settings.concatenate);
        assert_eq!(project.project_settings.request_delay_ms, 500);
        assert_eq!(project.project_settings.file_extension(), "pcm");

        let production = project.production.unwrap();
        assert_eq!(production.background_track.unwrap().volume, 0.3);
        assert_eq!(production.sound_effects[0].start_time_ms, 1500);
    }

    #[test]
    fn test_resolve_api_key_prefers_flag() {
        let mut config = Config::default();
        config.api.api_key = Some("from-config".to_string());
        assert_eq!(
            config.resolve_api_key(Some("from-flag")).as_deref(),
            Some("from-flag")
        );
    }

    #[test]
    fn test_blank_api_key_sources_are_skipped() {
        let key = |flag: Option<&str>, env: Option<&str>, file: Option<&str>| {
            first_usable_key([
                flag.map(str::to_string),
                env.map(str::to_string),
                file.map(str::to_string),
            ])
        };
        assert_eq!(key(Some("  "), Some("from-env"), None).as_deref(), Some("from-env"));
        assert_eq!(key(Some(""), Some(" "), Some("from-config")).as_deref(), Some("from-config"));
        assert_eq!(key(Some("flag"), Some("env"), Some("file")).as_deref(), Some("flag"));
        assert_eq!(key(Some(" "), None, Some("\t")), None);
    }
}
