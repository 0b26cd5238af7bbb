//! 按 key 的滑动窗口限流
//!
//! 清理、检查、追加在同一把锁内完成，同一 key 的并发调用不会交错。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_per_window: usize,
    pub window: Duration,
    /// 超过此时长未出现的 key 在下一次检查前被清空
    pub entry_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window: Duration::from_secs(60),
            entry_ttl: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug)]
struct RateBucket {
    hits: VecDeque<Instant>,
    last_seen: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, RateBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// 尝试放行一次；被拒绝返回 false
    pub async fn try_admit(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| RateBucket {
                hits: VecDeque::new(),
                last_seen: now,
            });

        if now.saturating_duration_since(bucket.last_seen) > self.config.entry_ttl {
            bucket.hits.clear();
        }
        while let Some(first) = bucket.hits.front() {
            if now.saturating_duration_since(*first) >= self.config.window {
                bucket.hits.pop_front();
            } else {
                break;
            }
        }
        bucket.last_seen = now;

        if bucket.hits.len() < self.config.max_per_window {
            bucket.hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// 删除长时间无活动的 key，返回删除数量
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.entry_ttl;
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) <= ttl);
        before - buckets.len()
    }

    pub async fn tracked_keys(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
