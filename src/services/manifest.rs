use crate::core::state::{DialogueChunk, GeneratedBlob, WordTimestamp};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const WORDS_PER_MINUTE: u64 = 150;

/// One line of the delivered audio, in script order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// 1-based position in the script.
    pub index: usize,
    pub character: String,
    pub filename: String,
    pub text: String,
    pub estimated_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTimestamp>>,
}

pub fn estimate_duration_ms(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    words * 60_000 / WORDS_PER_MINUTE
}

/// Pairs chunks with their blobs. Real timings win over the word-count estimate.
pub fn build_manifest(chunks: &[DialogueChunk], blobs: &[GeneratedBlob]) -> Vec<ManifestEntry> {
    chunks
        .iter()
        .zip(blobs)
        .enumerate()
        .map(|(i, (chunk, blob))| {
            let start_time_ms = blob.start_time_ms.or(chunk.start_time_ms);
            let end_time_ms = blob.end_time_ms.or(chunk.end_time_ms);
            let estimated_duration_ms = match (start_time_ms, end_time_ms) {
                (Some(start), Some(end)) if end >= start => end - start,
                _ => estimate_duration_ms(&chunk.text),
            };
            ManifestEntry {
                index: i + 1,
                character: chunk.character.clone(),
                filename: blob.filename.clone(),
                text: chunk.text.clone(),
                estimated_duration_ms,
                start_time_ms,
                end_time_ms,
                words: blob.alignment.clone().or_else(|| chunk.words.clone()),
            }
        })
        .collect()
}

pub fn to_json(entries: &[ManifestEntry]) -> Result<String> {
    serde_json::to_string_pretty(entries).context("Failed to serialize manifest")
}

pub fn to_csv(entries: &[ManifestEntry]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::NonNumeric)
        .from_writer(Vec::new());
    writer.write_record([
        "Index",
        "Character",
        "Filename",
        "Text",
        "Estimated Duration (ms)",
        "Start (ms)",
        "End (ms)",
    ])?;

    let optional = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_default();
    for entry in entries {
        writer.write_record([
            entry.index.to_string(),
            entry.character.clone(),
            entry.filename.clone(),
            entry.text.clone(),
            entry.estimated_duration_ms.to_string(),
            optional(entry.start_time_ms),
            optional(entry.end_time_ms),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush manifest CSV: {}", e))?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(filename: &str, timing: Option<(u64, u64)>) -> GeneratedBlob {
        GeneratedBlob {
            blob: vec![0],
            filename: filename.to_string(),
            start_time_ms: timing.map(|t| t.0),
            end_time_ms: timing.map(|t| t.1),
            alignment: None,
        }
    }

    #[test]
    fn test_manifest_uses_timings_or_estimate() {
        let chunks = vec![
            DialogueChunk::new("JOHN", "one two three four five", "one two three four five"),
            DialogueChunk::new("JANE", "Hi.", "Hi."),
        ];
        let blobs = vec![blob("0001_JOHN.mp3", None), blob("0002_JANE.mp3", Some((100, 900)))];

        let manifest = build_manifest(&chunks, &blobs);
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].index, 1);
        // 5 words at 150 wpm
        assert_eq!(manifest[0].estimated_duration_ms, 2000);
        assert_eq!(manifest[0].start_time_ms, None);
        assert_eq!(manifest[1].index, 2);
        assert_eq!(manifest[1].estimated_duration_ms, 800);
        assert_eq!(manifest[1].filename, "0002_JANE.mp3");
    }

    #[test]
    fn test_csv_doubles_embedded_quotes() -> Result<()> {
        let chunks = vec![DialogueChunk::new(
            "JOHN",
            r#"She said "run", so I ran."#,
            r#"She said "run", so I ran."#,
        )];
        let manifest = build_manifest(&chunks, &[blob("0001_JOHN.mp3", None)]);

        let csv = to_csv(&manifest)?;
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("\"Index\",\"Character\""));
        let row = lines.next().unwrap();
        assert!(row.contains(r#""She said ""run"", so I ran.""#));
        Ok(())
    }

    #[test]
    fn test_json_uses_camel_case() -> Result<()> {
        let chunks = vec![DialogueChunk::new("JOHN", "Hi.", "Hi.")];
        let json = to_json(&build_manifest(&chunks, &[blob("0001_JOHN.mp3", Some((0, 500)))]))?;
        let value: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(value[0]["estimatedDurationMs"], 500);
        assert_eq!(value[0]["startTimeMs"], 0);
        assert!(value[0].get("words").is_none());
        Ok(())
    }
}
