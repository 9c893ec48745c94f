//! On-disk cache of LoRA weights fetched for generation.
//!
//! Files are named after a digest of their object key, so a key always maps
//! to the same file and an existing file is trusted as-is. Hits bump the
//! file's mtime so an external sweeper can evict by age.
//!
//! Each download goes to its own partial file and is renamed into place, so
//! concurrent misses on one key never share a file.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use studio_cloud::ObjectStore;
use studio_core::hashing::short_digest;
use studio_core::keys::WEIGHTS_BUCKET;
use uuid::Uuid;

use crate::error::JobError;

const DIGEST_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct LoraCache {
    dir: PathBuf,
}

impl LoraCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `lora_<digest>.safetensors`; the name the workflow refers to.
    pub fn filename_for(key: &str) -> String {
        format!("lora_{}.safetensors", short_digest(key.as_bytes(), DIGEST_LEN))
    }

    /// Make the weights at `key` available locally and return their filename.
    pub async fn resolve(&self, store: &dyn ObjectStore, key: &str) -> Result<String, JobError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let filename = Self::filename_for(key);
        let path = self.dir.join(&filename);

        if tokio::fs::try_exists(&path).await? {
            tracing::debug!(key, filename = %filename, "LoRA cache hit");
            touch(path).await;
            return Ok(filename);
        }

        tracing::info!(key, filename = %filename, "LoRA cache miss, downloading");
        let partial = self
            .dir
            .join(format!("{filename}.part-{}", Uuid::new_v4().simple()));
        let size = match store.download_to(WEIGHTS_BUCKET, key, &partial).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        tracing::info!(key, filename = %filename, size, "LoRA cached");
        Ok(filename)
    }
}

async fn touch(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .append(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()))
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to refresh LoRA mtime"),
        Err(e) => tracing::warn!(error = %e, "LoRA mtime task failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use studio_cloud::{MemoryStore, StorageError};

    use super::*;

    #[test]
    fn filename_is_stable_per_key() {
        let a = LoraCache::filename_for("u/s/lora.safetensors");
        assert_eq!(a, LoraCache::filename_for("u/s/lora.safetensors"));
        assert_ne!(a, LoraCache::filename_for("u/t/lora.safetensors"));
        assert!(a.starts_with("lora_") && a.ends_with(".safetensors"));
        assert_eq!(a.len(), "lora_".len() + 12 + ".safetensors".len());
    }

    #[tokio::test]
    async fn miss_downloads_then_hit_skips_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LoraCache::new(dir.path().join("loras"));
        let store = MemoryStore::new();
        store.insert(WEIGHTS_BUCKET, "s1/lora.safetensors", b"weights".to_vec());

        let filename = cache.resolve(&store, "s1/lora.safetensors").await.unwrap();
        let path = cache.dir().join(&filename);
        assert_eq!(std::fs::read(&path).unwrap(), b"weights");

        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .append(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        // Denied now, so a second download would fail.
        store.deny(WEIGHTS_BUCKET, "s1/lora.safetensors");
        assert_eq!(cache.resolve(&store, "s1/lora.safetensors").await.unwrap(), filename);

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(modified > old + Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_misses_on_one_key_both_succeed() {
        let weights = vec![7u8; 256 * 1024];
        for _ in 0..10 {
            let dir = tempfile::tempdir().unwrap();
            let cache = LoraCache::new(dir.path());
            let store = MemoryStore::new();
            store.insert(WEIGHTS_BUCKET, "s1/lora.safetensors", weights.clone());

            let (a, b) = tokio::join!(
                cache.resolve(&store, "s1/lora.safetensors"),
                cache.resolve(&store, "s1/lora.safetensors"),
            );
            let filename = a.unwrap();
            assert_eq!(b.unwrap(), filename);

            assert_eq!(std::fs::read(dir.path().join(&filename)).unwrap(), weights);
            let names: Vec<String> = std::fs::read_dir(dir.path())
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            assert_eq!(names, vec![filename]);
        }
    }

    #[tokio::test]
    async fn missing_weights_leave_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LoraCache::new(dir.path());
        let store = MemoryStore::new();

        let err = cache.resolve(&store, "nope/lora.safetensors").await.unwrap_err();
        assert_matches!(err, JobError::Storage(StorageError::NotFound { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
