//! 指数退避重试
//!
//! 连接初始化与受保护的外部调用共用：失败且可重试时等待 `min(max_delay, base_delay * 2^attempt)` 后重试，
//! 不加抖动；不可重试或次数用尽时返回最后一次错误。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// 重试策略：`max_retries` 为首次尝试之后允许的重试次数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// 不重试：只跑一次
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// 第 `attempt` 次重试前的等待时间（attempt 从 0 计）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// 执行 operation，按 is_retryable 判定是否重试
    pub async fn execute<T, E, F, Fut, R>(
        &self,
        label: &str,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.max_retries || !is_retryable(&e) {
                        return Err(e);
                    }
                    let wait = self.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        label,
                        attempt,
                        self.max_retries + 1,
                        wait.as_millis(),
                        e
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_capped_exponential() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_secs(15));
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(15));
        assert_eq!(policy.delay_for(40), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = policy
            .execute(
                "op",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("ECONNRESET".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy
            .execute(
                "op",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad request".to_string())
                },
                |e| e.contains("ECONNRESET"),
            )
            .await;
        assert_eq!(result, Err("bad request".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), String> = policy
            .execute(
                "op",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure {}", n))
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
