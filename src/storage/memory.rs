use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{BlobError, BlobStore};

/// In-process blob store with switches for simulating backend failures.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Overwrites an object in place, bypassing any failure switches.
    pub fn tamper(&self, key: &str, bytes: Vec<u8>) {
        self.objects.insert(key.to_string(), bytes);
    }

    /// Drops an object without going through `delete`.
    pub fn remove_silently(&self, key: &str) {
        self.objects.remove(key);
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobError::Backend(format!("simulated upload failure for {}", key)));
        }
        self.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Backend(format!("simulated delete failure for {}", key)));
        }
        self.objects.remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
