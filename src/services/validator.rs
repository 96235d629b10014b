use crate::core::state::{CharacterConfigs, DialogueChunk};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Pre-flight checks before any synthesis request is made. Every failing
/// check contributes an error; nothing short-circuits.
pub fn validate(
    chunks: &[DialogueChunk],
    character_configs: &CharacterConfigs,
    api_key: &str,
) -> ValidationResult {
    let mut errors = Vec::new();

    if api_key.trim().is_empty() {
        errors.push("API key is required".to_string());
    }

    if chunks.is_empty() {
        errors.push("No dialogue chunks found in script".to_string());
    }

    let missing = characters_without_voice(chunks, character_configs);
    if !missing.is_empty() {
        errors.push(format!("Missing voice IDs for: {}", missing.join(", ")));
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
    }
}

/// Speaking characters lacking a usable voice, in order of first appearance.
pub fn characters_without_voice(
    chunks: &[DialogueChunk],
    character_configs: &CharacterConfigs,
) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    for chunk in chunks {
        let has_voice = character_configs
            .get(&chunk.character)
            .is_some_and(|c| !c.voice_id.trim().is_empty());
        if !has_voice && !missing.contains(&chunk.character) {
            missing.push(chunk.character.clone());
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::CharacterConfig;

    fn configs(entries: &[(&str, &str)]) -> CharacterConfigs {
        entries
            .iter()
            .map(|(name, voice)| {
                (
                    name.to_string(),
                    CharacterConfig {
                        voice_id: voice.to_string(),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_valid_configuration() {
        let chunks = vec![DialogueChunk::new("JOHN", "Hi.", "Hi.")];
        let result = validate(&chunks, &configs(&[("JOHN", "v1")]), "key");
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_missing_voice_is_reported_by_name() {
        let chunks = vec![
            DialogueChunk::new("JOHN", "Hi.", "Hi."),
            DialogueChunk::new("JANE", "Hello.", "Hello."),
        ];
        let result = validate(&chunks, &configs(&[("JOHN", "v1"), ("JANE", "")]), "key");
        assert!(!result.valid);
        assert_eq!(result.errors, vec!["Missing voice IDs for: JANE"]);
    }

    #[test]
    fn test_errors_accumulate() {
        let result = validate(&[], &CharacterConfigs::new(), "  ");
        assert_eq!(
            result.errors,
            vec!["API key is required", "No dialogue chunks found in script"]
        );

        let chunks = vec![
            DialogueChunk::new("B", "1", "1"),
            DialogueChunk::new("A", "2", "2"),
            DialogueChunk::new("B", "3", "3"),
        ];
        let result = validate(&chunks, &CharacterConfigs::new(), "");
        assert_eq!(
            result.errors,
            vec!["API key is required", "Missing voice IDs for: B, A"]
        );
    }
}
