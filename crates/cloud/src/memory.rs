//! In-process [`ObjectStore`] used by job and handler tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::storage::{ObjectInfo, ObjectStore, PutOptions, StorageError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub options: PutOptions,
}

type ObjectKey = (String, String);

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<ObjectKey, StoredObject>>,
    denied: Mutex<HashSet<ObjectKey>>,
    transient_failures: Mutex<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        lock(&self.objects).insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                options: PutOptions::default(),
            },
        );
    }

    /// Make every request for `bucket/key` fail with `AccessDenied`.
    pub fn deny(&self, bucket: &str, key: &str) {
        lock(&self.denied).insert((bucket.to_string(), key.to_string()));
    }

    /// Make the next `count` requests fail with a retryable provider error.
    pub fn fail_next(&self, count: u32) {
        *lock(&self.transient_failures) = count;
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.objects)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn check(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        {
            let mut pending = lock(&self.transient_failures);
            if *pending > 0 {
                *pending -= 1;
                return Err(StorageError::Provider {
                    code: "InternalError".to_string(),
                    message: "injected failure".to_string(),
                });
            }
        }
        if lock(&self.denied).contains(&(bucket.to_string(), key.to_string())) {
            return Err(StorageError::AccessDenied {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.check(bucket, key)?;
        self.object(bucket, key)
            .map(|object| object.body)
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: PutOptions,
    ) -> Result<(), StorageError> {
        self.check(bucket, key)?;
        lock(&self.objects).insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { body, options },
        );
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        self.check(bucket, key)?;
        let object = self
            .object(bucket, key)
            .ok_or_else(|| Self::not_found(bucket, key))?;
        Ok(ObjectInfo {
            size: object.body.len() as u64,
            content_type: object.options.content_type,
            metadata: object.options.metadata,
        })
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        self.check(bucket, key)?;
        Ok(format!(
            "memory://{bucket}/{key}?expires={}",
            expires_in.as_secs()
        ))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
