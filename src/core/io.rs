use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Durable byte store addressed by `/`-separated keys.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn write(&self, key: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

// --- Native Implementation ---

/// Filesystem storage; keys are paths relative to `root`.
pub struct NativeStorage {
    root: PathBuf,
}

impl NativeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key);
        if tokio::fs::try_exists(&path).await? {
            if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(key)).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = self.resolve(prefix);
        let mut entries = Vec::new();

        if path.is_dir() {
            let mut dir = tokio::fs::read_dir(&path).await?;
            while let Some(entry) = dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                entries.push(join_key(prefix, &name));
            }
        } else if path.exists() {
            entries.push(prefix.to_string());
        }

        entries.sort();
        Ok(entries)
    }
}

// --- In-memory Implementation ---

/// Process-local storage, used for tests and for runs that must not touch disk.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.entries.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Key not found: {}", key))
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        entries.insert(key.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let entries = self.entries.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        Ok(entries.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Joins two key segments, treating an empty prefix as the root.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_native_storage_roundtrip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(temp_dir.path());

        storage.write("state/user-progress", b"{}").await?;
        assert!(storage.exists("state/user-progress").await?);
        assert_eq!(storage.read("state/user-progress").await?, b"{}");

        let listed = storage.list("state").await?;
        assert_eq!(listed, vec!["state/user-progress".to_string()]);

        storage.delete("state/user-progress").await?;
        assert!(!storage.exists("state/user-progress").await?);
        // Deleting twice is fine
        storage.delete("state/user-progress").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_storage_list_by_prefix() -> Result<()> {
        let storage = MemoryStorage::new();
        storage.write("a-1", b"1").await?;
        storage.write("a-2", b"2").await?;
        storage.write("b-1", b"3").await?;

        assert_eq!(storage.list("a-").await?, vec!["a-1", "a-2"]);
        assert!(storage.read("missing").await.is_err());
        Ok(())
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "x"), "x");
        assert_eq!(join_key("state/", "x"), "state/x");
        assert_eq!(join_key("state", "x"), "state/x");
    }
}
