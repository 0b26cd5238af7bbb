//! 临时文件清理
//!
//! 周期性删除临时目录中超过最大存活时长的普通文件。文件系统操作经由独立的熔断器，
//! 磁盘持续出错时暂停清理，不影响消息处理。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::StorageSection;
use crate::resilience::{BreakerConfig, BreakerError, CircuitBreaker, RetryPolicy};

/// 清理周期下限
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
}

pub struct TempCleaner {
    dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl TempCleaner {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration, interval: Duration) -> Self {
        let breaker = CircuitBreaker::new(
            "file-io",
            BreakerConfig {
                retry: RetryPolicy::none(),
                call_timeout: Some(Duration::from_secs(60)),
                ..BreakerConfig::default()
            },
        );
        Self {
            dir: dir.into(),
            max_age,
            interval: interval.max(MIN_INTERVAL),
            breaker: Arc::new(breaker),
        }
    }

    pub fn from_config(config: &StorageSection) -> Self {
        Self::new(
            config.temp_dir.clone(),
            Duration::from_secs(config.temp_max_age_secs),
            Duration::from_secs(config.cleanup_interval_secs),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// 清理一次
    pub async fn run_once(&self) -> Result<CleanupReport, BreakerError<std::io::Error>> {
        let report = self
            .breaker
            .call_guarded("temp_cleanup", || self.sweep(), |_| false)
            .await?;
        if report.deleted > 0 {
            tracing::info!(
                "Temp cleanup: {} file(s) deleted ({} scanned)",
                report.deleted,
                report.scanned
            );
        } else {
            tracing::debug!("Temp cleanup: nothing to delete ({} scanned)", report.scanned);
        }
        Ok(report)
    }

    async fn sweep(&self) -> Result<CleanupReport, std::io::Error> {
        let mut report = CleanupReport::default();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e),
        };
        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };
            report.scanned += 1;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age > self.max_age {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => tracing::warn!("Failed to delete {}: {}", path.display(), e),
                }
            }
        }
        Ok(report)
    }

    /// 按间隔清理直到关闭
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!("Temp cleanup skipped: {}", e);
                    }
                }
            }
        }
    }
}
