use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;
use verifix_common::redis::{get_result, store_result};
use verifix_common::types::VerificationResult;

/// Durable home of finished verification records.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, result: &VerificationResult) -> Result<(), StoreError>;

    /// `Ok(None)` when the record never existed or has expired.
    async fn load(&self, id: &Uuid) -> Result<Option<VerificationResult>, StoreError>;
}

/// Redis-backed store; records are JSON under `verifix:result:{id}` with a TTL.
#[derive(Clone)]
pub struct RedisResultStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisResultStore {
    pub fn new(conn: ConnectionManager, ttl_seconds: u64) -> Self {
        Self { conn, ttl_seconds }
    }

    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, ttl_seconds))
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn save(&self, result: &VerificationResult) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        store_result(&mut conn, result, self.ttl_seconds).await?;
        debug!(verification_id = %result.id, ttl_seconds = self.ttl_seconds, "Result stored");
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<VerificationResult>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(get_result(&mut conn, id).await?)
    }
}

/// Process-local store for the CLI, tests, and APIs running without redis.
pub struct MemoryResultStore {
    ttl: Duration,
    records: Mutex<HashMap<Uuid, (Instant, VerificationResult)>>,
}

impl MemoryResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, result: &VerificationResult) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        let now = Instant::now();
        records.retain(|_, (stored_at, _)| now.duration_since(*stored_at) < self.ttl);
        records.insert(result.id, (now, result.clone()));
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<VerificationResult>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(records
            .get(id)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, result)| result.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verifix_common::types::Language;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryResultStore::new(Duration::from_secs(60));
        let record = VerificationResult::begin("echo hi", Language::Bash);

        store.save(&record).await.unwrap();

        let loaded = store.load(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.original_code, "echo hi");
        assert!(store.load(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_expires_records() {
        let store = MemoryResultStore::new(Duration::from_millis(50));
        let record = VerificationResult::begin("x", Language::Bash);
        store.save(&record).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.load(&record.id).await.unwrap().is_none());
        store.save(&VerificationResult::begin("y", Language::Bash)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_store_round_trip() {
        let store = RedisResultStore::connect("redis://127.0.0.1:6379", 60)
            .await
            .expect("Failed to connect to Redis");
        let record = VerificationResult::begin("print(1)", Language::Python);

        store.save(&record).await.unwrap();

        let loaded = store.load(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.original_code, "print(1)");
    }
}
