use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Abstraction over a key-value store used for upgrade tickets.
///
/// Backed by Redis or similar in a full deployment and an in-memory map here.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

pub struct MemoryKv {
    data: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        // Unredeemed tickets are never read again; drop them on the next write.
        data.retain(|_, (_, expires_at)| *expires_at > now);
        data.insert(
            key.to_string(),
            (value.to_string(), now + Duration::from_secs(ttl_secs)),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut data = self.data.lock();
        match data.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                data.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", 30).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        kv.del("k").await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_keys_read_as_missing() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", 0).await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_purge_expired_keys_that_were_never_read() {
        let kv = MemoryKv::new();
        kv.set_ex("abandoned", "v", 0).await.unwrap();
        kv.set_ex("fresh", "v", 30).await.unwrap();

        assert_eq!(kv.data.lock().len(), 1);
        assert!(!kv.data.lock().contains_key("abandoned"));
        assert_eq!(kv.get("fresh").await.unwrap().as_deref(), Some("v"));
    }
}
