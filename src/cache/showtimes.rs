use chrono::NaiveDate;
use redis::AsyncCommands;
use tracing::warn;

use crate::cache::CacheService;
use crate::services::MovieShowtimes;

fn showtimes_key(date: NaiveDate) -> String {
    format!("showtimes:{}", date.format("%Y-%m-%d"))
}

impl CacheService {
    pub async fn get_showtimes(&self, date: NaiveDate) -> Option<Vec<MovieShowtimes>> {
        let mut conn = self.redis.conn.clone();
        let cached: Option<String> = match conn.get(showtimes_key(date)).await {
            Ok(value) => value,
            Err(e) => {
                warn!("showtime cache read failed: {}", e);
                return None;
            }
        };
        cached.and_then(|json| serde_json::from_str(&json).ok())
    }

    pub async fn store_showtimes(&self, date: NaiveDate, listing: &[MovieShowtimes]) {
        let Ok(json) = serde_json::to_string(listing) else {
            return;
        };
        let mut conn = self.redis.conn.clone();
        let result: redis::RedisResult<()> = conn.set_ex(showtimes_key(date), json, self.ttl_seconds).await;
        if let Err(e) = result {
            warn!("showtime cache write failed: {}", e);
        }
    }

    pub async fn invalidate_showtimes(&self, date: NaiveDate) {
        let mut conn = self.redis.conn.clone();
        let result: redis::RedisResult<()> = conn.del(showtimes_key(date)).await;
        if let Err(e) = result {
            warn!("showtime cache invalidation failed: {}", e);
        }
    }
}
