use crate::types::VerificationResult;
use redis::{AsyncCommands, RedisResult};

/// Redis key layout for persisted verification records.
/// The API and the engine share these so keys never drift.

pub const RESULT_PREFIX: &str = "verifix:result";

/// Seven days, the default retention for a verification record.
pub const DEFAULT_RESULT_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Generate result key for a verification record
pub fn result_key(id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Store a verification record as JSON with a TTL
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    result: &VerificationResult,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let key = result_key(&result.id);
    let payload = serde_json::to_string(result).map_err(serialization_error)?;

    let _: () = conn.set_ex(&key, payload, ttl_seconds).await?;
    Ok(())
}

/// Retrieve a verification record, `None` if absent or expired
pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    id: &uuid::Uuid,
) -> RedisResult<Option<VerificationResult>> {
    let key = result_key(id);
    let payload: Option<String> = conn.get(&key).await?;

    match payload {
        Some(data) => {
            let result: VerificationResult = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
            })?;
            Ok(Some(result))
        }
        None => Ok(None),
    }
}
