use crate::core::config::ProjectSettings;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A character declared in (or discovered from) a screenplay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DefinedCharacter {
    pub full_name: String,
    pub aliases: BTreeSet<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WordTimestamp {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DialogueChunk {
    pub character: String,
    pub text: String,
    pub original_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTimestamp>>,
}

impl DialogueChunk {
    pub fn new(character: &str, text: &str, original_text: &str) -> Self {
        Self {
            character: character.to_string(),
            text: text.to_string(),
            original_text: original_text.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub speed: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            speed: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CharacterConfig {
    #[serde(default)]
    pub voice_id: String,
    #[serde(default)]
    pub voice_settings: VoiceSettings,
}

pub type CharacterConfigs = HashMap<String, CharacterConfig>;

/// One synthesized chunk. The audio bytes are persisted as base64.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedBlob {
    #[serde(with = "base64_bytes")]
    pub blob: Vec<u8>,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<Vec<WordTimestamp>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    InProgress,
    Paused,
    Completed,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationProgressState {
    /// Milliseconds since the Unix epoch of the last write.
    pub timestamp: i64,
    pub dialogue_chunks: Vec<DialogueChunk>,
    pub character_configs: CharacterConfigs,
    pub project_settings: ProjectSettings,
    pub current_index: usize,
    pub total_chunks: usize,
    pub status: GenerationStatus,
    #[serde(default)]
    pub generated_files: Vec<String>,
    #[serde(default)]
    pub last_message: String,
}

/// Partial update merged into a stored [`GenerationProgressState`].
#[derive(Clone, Debug, Default)]
pub struct ProgressUpdate {
    pub current_index: Option<usize>,
    pub status: Option<GenerationStatus>,
    pub generated_files: Option<Vec<String>>,
    pub last_message: Option<String>,
}

/// Cumulative run counters for one user.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    pub runs_started: u32,
    pub runs_completed: u32,
    pub runs_cancelled: u32,
    pub runs_failed: u32,
    pub chunks_generated: u64,
    pub characters_synthesized: u64,
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<i64>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_persists_audio_as_base64() {
        let blob = GeneratedBlob {
            blob: vec![0, 159, 146, 150],
            filename: "0001_JOHN.mp3".to_string(),
            start_time_ms: Some(0),
            end_time_ms: Some(1200),
            alignment: None,
        };
        let json = serde_json::to_value(&blob).unwrap();
        assert_eq!(json["blob"], "AJ+Slg==");
        assert_eq!(json["startTimeMs"], 0);
        assert!(json.get("alignment").is_none());

        let back: GeneratedBlob = serde_json::from_value(json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn test_character_config_reads_project_file_shape() {
        let json = r#"{
            "voiceId": "abc123",
            "voiceSettings": { "stability": 0.3, "similarity_boost": 0.8, "style": 0.1, "speed": 1.1 }
        }"#;
        let cfg: CharacterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.voice_id, "abc123");
        assert_eq!(cfg.voice_settings.similarity_boost, 0.8);

        let bare: CharacterConfig = serde_json::from_str(r#"{"voiceId": "x"}"#).unwrap();
        assert_eq!(bare.voice_settings, VoiceSettings::default());
    }

    #[test]
    fn test_partial_voice_settings_keep_defaults() {
        let cfg: CharacterConfig =
            serde_json::from_str(r#"{"voiceId": "x", "voiceSettings": {"stability": 0.3}}"#)
                .unwrap();
        assert_eq!(cfg.voice_settings.stability, 0.3);
        assert_eq!(cfg.voice_settings.similarity_boost, 0.75);
        assert_eq!(cfg.voice_settings.speed, 1.0);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&GenerationStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        let paused: GenerationStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(paused, GenerationStatus::Paused);
    }
}
