use tracing::info;

use crate::redis_client::RedisClient;

pub mod showtimes;

/// Read-through cache for listing endpoints. Every failure degrades to a miss.
#[derive(Clone)]
pub struct CacheService {
    redis: RedisClient,
    ttl_seconds: u64,
}

impl CacheService {
    pub fn new(redis: RedisClient, ttl_seconds: u64) -> Self {
        info!(ttl_seconds, "showtime cache enabled");
        Self { redis, ttl_seconds }
    }
}
