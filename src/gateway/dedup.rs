//! 消息去重与自发回声识别
//!
//! 两个独立结构共用一个组件：
//! - 已处理消息 ID：按插入顺序保存，超出容量时批量淘汰最早的一批（FIFO，不是 LRU）
//! - 自发消息指纹：sha256(目标, 规范化文本, 5 秒时间桶) → 插入时间；查询时惰性清理过期项，
//!   插入时按容量淘汰最早的一批。查询覆盖当前桶与前两个桶，容忍发送与回声之间的时延。

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 自发消息时间桶宽度
pub const ECHO_BUCKET: Duration = Duration::from_millis(5000);

/// 查询时向前回看的桶数（不含当前桶）
const ECHO_LOOKBACK_BUCKETS: u64 = 2;

/// 去重配置
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub processed_limit: usize,
    pub processed_cleanup_size: usize,
    pub echo_cache_limit: usize,
    pub echo_cleanup_size: usize,
    pub echo_ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            processed_limit: 1000,
            processed_cleanup_size: 200,
            echo_cache_limit: 2000,
            echo_cleanup_size: 1000,
            echo_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

#[derive(Debug, Default)]
struct EchoIndex {
    entries: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl EchoIndex {
    /// 淘汰队首一项；同一指纹被重新登记过时只删队列项，保留较新的映射
    fn pop_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some((hash, inserted)) => {
                if self.entries.get(&hash) == Some(&inserted) {
                    self.entries.remove(&hash);
                }
                true
            }
            None => false,
        }
    }
}

/// 去重器
pub struct Deduplicator {
    config: DedupConfig,
    seen: Mutex<SeenIds>,
    echoes: Mutex<EchoIndex>,
    /// 时间桶的起点
    epoch: Instant,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            seen: Mutex::new(SeenIds::default()),
            echoes: Mutex::new(EchoIndex::default()),
            epoch: Instant::now(),
        }
    }

    pub async fn has_seen(&self, id: &str) -> bool {
        self.seen.lock().await.set.contains(id)
    }

    pub async fn mark_seen(&self, id: &str) {
        let mut seen = self.seen.lock().await;
        self.insert_seen(&mut seen, id);
    }

    /// 原子地检查并标记：首次见到返回 true
    pub async fn check_and_mark(&self, id: &str) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.set.contains(id) {
            return false;
        }
        self.insert_seen(&mut seen, id);
        true
    }

    fn insert_seen(&self, seen: &mut SeenIds, id: &str) {
        if seen.set.contains(id) {
            return;
        }
        if seen.set.len() >= self.config.processed_limit {
            let batch = self.config.processed_cleanup_size.max(1);
            for _ in 0..batch {
                match seen.order.pop_front() {
                    Some(old) => {
                        seen.set.remove(&old);
                    }
                    None => break,
                }
            }
            tracing::debug!(
                "Evicted processed message ids, {} remain",
                seen.set.len()
            );
        }
        seen.set.insert(id.to_string());
        seen.order.push_back(id.to_string());
    }

    pub async fn seen_count(&self) -> usize {
        self.seen.lock().await.set.len()
    }

    /// 发送前登记自发消息
    pub async fn register_outbound(&self, destination: &str, text: &str) {
        let now = Instant::now();
        let hash = self.echo_hash(destination, text, self.bucket_of(now));
        let mut echoes = self.echoes.lock().await;
        echoes.entries.insert(hash.clone(), now);
        echoes.order.push_back((hash, now));

        if echoes.entries.len() > self.config.echo_cache_limit {
            let batch = self.config.echo_cleanup_size.max(1);
            for _ in 0..batch {
                if !echoes.pop_oldest() {
                    break;
                }
            }
        }
    }

    /// 该账号发出的入站消息是否为本进程刚发送内容的回声
    pub async fn is_echo(&self, origin: &str, text: &str) -> bool {
        let now = Instant::now();
        let mut echoes = self.echoes.lock().await;

        while let Some((_, inserted)) = echoes.order.front() {
            if now.saturating_duration_since(*inserted) > self.config.echo_ttl {
                echoes.pop_oldest();
            } else {
                break;
            }
        }

        let current = self.bucket_of(now);
        (0..=ECHO_LOOKBACK_BUCKETS)
            .filter_map(|back| current.checked_sub(back))
            .any(|bucket| {
                echoes
                    .entries
                    .contains_key(&self.echo_hash(origin, text, bucket))
            })
    }

    pub async fn echo_count(&self) -> usize {
        self.echoes.lock().await.entries.len()
    }

    fn bucket_of(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch).as_millis();
        (elapsed / ECHO_BUCKET.as_millis()) as u64
    }

    fn echo_hash(&self, destination: &str, text: &str, bucket: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(destination.as_bytes());
        hasher.update(b":");
        hasher.update(normalize_text(text).as_bytes());
        hasher.update(b":");
        hasher.update(bucket.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

/// 规范化文本：去首尾空白，统一换行
fn normalize_text(text: &str) -> String {
    text.trim().replace("\r\n", "\n")
}
