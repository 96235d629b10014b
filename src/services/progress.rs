use crate::core::io::Storage;
use crate::core::state::{
    GeneratedBlob, GenerationProgressState, GenerationStats, GenerationStatus, ProgressUpdate,
};
use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Every record kept per user in durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKey {
    ScriptText,
    GenerationState,
    GeneratedBlobs,
    GenerationStats,
    ProjectHistory,
    Comments,
    GenerationProgress,
}

impl StorageKey {
    pub const ALL: [StorageKey; 7] = [
        StorageKey::ScriptText,
        StorageKey::GenerationState,
        StorageKey::GeneratedBlobs,
        StorageKey::GenerationStats,
        StorageKey::ProjectHistory,
        StorageKey::Comments,
        StorageKey::GenerationProgress,
    ];

    fn suffix(self) -> &'static str {
        match self {
            StorageKey::ScriptText => "scriptText",
            StorageKey::GenerationState => "generationState",
            StorageKey::GeneratedBlobs => "generatedBlobs",
            StorageKey::GenerationStats => "generationStats",
            StorageKey::ProjectHistory => "projectHistory",
            StorageKey::Comments => "comments",
            StorageKey::GenerationProgress => "generation-progress",
        }
    }

    pub fn for_user(self, user_id: &str) -> String {
        format!("{}-{}", user_id, self.suffix())
    }
}

/// Resumable generation state and its companion records, scoped per user.
#[derive(Clone)]
pub struct ProgressStore {
    storage: Arc<dyn Storage>,
    ttl: Duration,
}

impl ProgressStore {
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.storage.exists(key).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(key).await?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse stored record {}", key))?;
        Ok(Some(value))
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_vec(value)?;
        self.storage.write(key, &content).await
    }

    /// Stores `state`, stamping it with the current time.
    pub async fn save(&self, state: &GenerationProgressState, user_id: &str) -> Result<()> {
        let mut state = state.clone();
        state.timestamp = Utc::now().timestamp_millis();
        self.write_json(&StorageKey::GenerationProgress.for_user(user_id), &state)
            .await?;
        debug!(
            "Saved progress for {}: {}/{}",
            user_id, state.current_index, state.total_chunks
        );
        Ok(())
    }

    /// Returns the stored record, discarding it when older than the TTL.
    pub async fn load(&self, user_id: &str) -> Result<Option<GenerationProgressState>> {
        let key = StorageKey::GenerationProgress.for_user(user_id);
        let Some(state) = self.read_json::<GenerationProgressState>(&key).await? else {
            return Ok(None);
        };

        let age_ms = Utc::now().timestamp_millis() - state.timestamp;
        if age_ms > self.ttl.as_millis() as i64 {
            info!("Discarding expired progress for {}", user_id);
            self.clear(user_id).await?;
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Merges `update` into the stored record and refreshes its timestamp.
    pub async fn update(&self, user_id: &str, update: ProgressUpdate) -> Result<()> {
        let key = StorageKey::GenerationProgress.for_user(user_id);
        let Some(mut state) = self.read_json::<GenerationProgressState>(&key).await? else {
            warn!("No progress record for {} to update", user_id);
            return Ok(());
        };

        if let Some(index) = update.current_index {
            state.current_index = index.min(state.total_chunks);
        }
        if let Some(status) = update.status {
            state.status = status;
        }
        if let Some(files) = update.generated_files {
            state.generated_files = files;
        }
        if let Some(message) = update.last_message {
            state.last_message = message;
        }
        self.save(&state, user_id).await
    }

    /// Removes the progress record and the blob cache that backs it.
    pub async fn clear(&self, user_id: &str) -> Result<()> {
        self.storage
            .delete(&StorageKey::GenerationProgress.for_user(user_id))
            .await?;
        self.storage
            .delete(&StorageKey::GeneratedBlobs.for_user(user_id))
            .await
    }

    pub async fn has_resumable(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .load(user_id)
            .await?
            .is_some_and(|s| is_resumable(&s)))
    }

    pub async fn save_blobs(&self, user_id: &str, blobs: &[GeneratedBlob]) -> Result<()> {
        self.write_json(&StorageKey::GeneratedBlobs.for_user(user_id), &blobs)
            .await
    }

    pub async fn load_blobs(&self, user_id: &str) -> Result<Vec<GeneratedBlob>> {
        Ok(self
            .read_json(&StorageKey::GeneratedBlobs.for_user(user_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn load_stats(&self, user_id: &str) -> Result<GenerationStats> {
        Ok(self
            .read_json(&StorageKey::GenerationStats.for_user(user_id))
            .await?
            .unwrap_or_default())
    }

    /// Read-modify-write of the run statistics.
    pub async fn record_stats<F>(&self, user_id: &str, apply: F) -> Result<GenerationStats>
    where
        F: FnOnce(&mut GenerationStats) + Send,
    {
        let mut stats = self.load_stats(user_id).await?;
        apply(&mut stats);
        stats.last_run_at = Some(Utc::now().timestamp_millis());
        self.write_json(&StorageKey::GenerationStats.for_user(user_id), &stats)
            .await?;
        Ok(stats)
    }

    pub async fn save_text(&self, key: StorageKey, user_id: &str, text: &str) -> Result<()> {
        self.storage
            .write(&key.for_user(user_id), text.as_bytes())
            .await
    }
}

pub fn is_resumable(state: &GenerationProgressState) -> bool {
    matches!(
        state.status,
        GenerationStatus::InProgress | GenerationStatus::Paused
    ) && state.current_index < state.total_chunks
}

pub fn progress_percentage(state: &GenerationProgressState) -> u32 {
    if state.total_chunks == 0 {
        return 0;
    }
    (state.current_index as f64 / state.total_chunks as f64 * 100.0).round() as u32
}

/// Linear extrapolation from the time spent on the chunks done so far.
pub fn estimate_time_remaining(
    state: &GenerationProgressState,
    elapsed: Duration,
) -> Option<Duration> {
    if state.current_index == 0 {
        return None;
    }
    let remaining = state.total_chunks.saturating_sub(state.current_index) as u32;
    Some(elapsed / state.current_index as u32 * remaining)
}

pub fn format_time_remaining(estimate: Option<Duration>) -> String {
    match estimate {
        None => "Calculating...".to_string(),
        Some(d) => {
            let secs = d.as_secs();
            if secs >= 3600 {
                format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
            } else if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ProjectSettings;
    use crate::core::io::MemoryStorage;
    use crate::core::state::DialogueChunk;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn state(current_index: usize, total_chunks: usize) -> GenerationProgressState {
        GenerationProgressState {
            timestamp: 0,
            dialogue_chunks: vec![DialogueChunk::new("JOHN", "Hi.", "Hi."); total_chunks],
            character_configs: Default::default(),
            project_settings: ProjectSettings::default(),
            current_index,
            total_chunks,
            status: GenerationStatus::InProgress,
            generated_files: vec![],
            last_message: String::new(),
        }
    }

    fn store() -> (Arc<MemoryStorage>, ProgressStore) {
        let storage = Arc::new(MemoryStorage::default());
        (storage.clone(), ProgressStore::new(storage, DAY))
    }

    #[test]
    fn test_storage_keys() {
        assert_eq!(
            StorageKey::GenerationProgress.for_user("alice"),
            "alice-generation-progress"
        );
        assert_eq!(StorageKey::ScriptText.for_user("alice"), "alice-scriptText");
        assert_eq!(StorageKey::ALL.len(), 7);
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(progress_percentage(&state(1, 3)), 33);
        assert_eq!(progress_percentage(&state(2, 3)), 67);
        assert_eq!(progress_percentage(&state(0, 0)), 0);
    }

    #[test]
    fn test_time_remaining() {
        assert_eq!(estimate_time_remaining(&state(0, 4), Duration::from_secs(10)), None);
        assert_eq!(format_time_remaining(None), "Calculating...");

        let estimate = estimate_time_remaining(&state(2, 6), Duration::from_secs(20));
        assert_eq!(estimate, Some(Duration::from_secs(40)));
        assert_eq!(format_time_remaining(estimate), "40s");
        assert_eq!(format_time_remaining(Some(Duration::from_secs(125))), "2m 5s");
    }

    #[tokio::test]
    async fn test_save_load_and_resumable() -> Result<()> {
        let (_, store) = store();
        assert!(store.load("u").await?.is_none());

        store.save(&state(1, 3), "u").await?;
        let loaded = store.load("u").await?.unwrap();
        assert_eq!(loaded.current_index, 1);
        assert!(loaded.timestamp > 0);
        assert!(store.has_resumable("u").await?);

        store.save(&state(3, 3), "u").await?;
        assert!(!store.has_resumable("u").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_record_is_evicted() -> Result<()> {
        let (storage, store) = store();
        let mut old = state(1, 3);
        old.timestamp = Utc::now().timestamp_millis() - 25 * 3600 * 1000;
        let key = StorageKey::GenerationProgress.for_user("u");
        storage.write(&key, &serde_json::to_vec(&old)?).await?;

        assert!(store.load("u").await?.is_none());
        assert!(!storage.exists(&key).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_merges_fields() -> Result<()> {
        let (_, store) = store();
        // Missing record is a no-op.
        store
            .update(
                "u",
                ProgressUpdate {
                    current_index: Some(2),
                    ..Default::default()
                },
            )
            .await?;
        assert!(store.load("u").await?.is_none());

        store.save(&state(0, 3), "u").await?;
        store
            .update(
                "u",
                ProgressUpdate {
                    current_index: Some(2),
                    last_message: Some("Generated 0002_JOHN.mp3".into()),
                    ..Default::default()
                },
            )
            .await?;
        let loaded = store.load("u").await?.unwrap();
        assert_eq!(loaded.current_index, 2);
        assert_eq!(loaded.last_message, "Generated 0002_JOHN.mp3");
        assert_eq!(loaded.status, GenerationStatus::InProgress);
        Ok(())
    }

    #[tokio::test]
    async fn test_blobs_and_stats() -> Result<()> {
        let (_, store) = store();
        let blob = GeneratedBlob {
            blob: vec![1, 2, 3],
            filename: "0001_JOHN.mp3".into(),
            start_time_ms: None,
            end_time_ms: None,
            alignment: None,
        };
        store.save_blobs("u", &[blob.clone()]).await?;
        assert_eq!(store.load_blobs("u").await?, vec![blob]);

        store.record_stats("u", |s| s.runs_started += 1).await?;
        let stats = store
            .record_stats("u", |s| {
                s.runs_completed += 1;
                s.last_status = Some("completed".into());
            })
            .await?;
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.runs_completed, 1);
        assert!(stats.last_run_at.is_some());

        store.save(&state(1, 3), "u").await?;
        store.clear("u").await?;
        assert!(store.load("u").await?.is_none());
        assert!(store.load_blobs("u").await?.is_empty());
        Ok(())
    }
}
