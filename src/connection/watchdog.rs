//! 连接看门狗与二维码节流

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// 连接长时间无事件时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// 只记日志
    #[default]
    LogOnly,
    /// 记日志并按软断连重新初始化
    Reconnect,
}

/// 看门狗：记录最近一次事件，陈旧告警的间隔按 base → 2x → 4x … 递增至上限，有事件即复位
#[derive(Debug)]
pub struct Watchdog {
    stale_threshold: Duration,
    base_interval: Duration,
    log_cap: Duration,
    last_event: Instant,
    next_warn_at: Option<Instant>,
    backoff_step: u32,
}

impl Watchdog {
    pub fn new(stale_threshold: Duration, base_interval: Duration, log_cap: Duration) -> Self {
        Self {
            stale_threshold,
            base_interval,
            log_cap,
            last_event: Instant::now(),
            next_warn_at: None,
            backoff_step: 0,
        }
    }

    /// 收到任何事件时调用
    pub fn touch(&mut self) {
        self.last_event = Instant::now();
        self.next_warn_at = None;
        self.backoff_step = 0;
    }

    pub fn idle(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_event)
    }

    /// 周期检查；需要告警时返回空闲时长
    pub fn check(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let idle = now.saturating_duration_since(self.last_event);
        if idle <= self.stale_threshold {
            return None;
        }
        if let Some(at) = self.next_warn_at {
            if now < at {
                return None;
            }
        }
        let wait = self.current_backoff();
        self.next_warn_at = Some(now + wait);
        self.backoff_step = self.backoff_step.saturating_add(1);
        Some(idle)
    }

    /// 下一次告警前的抑制时长
    pub fn current_backoff(&self) -> Duration {
        let factor = 2u32.checked_pow(self.backoff_step).unwrap_or(u32::MAX);
        self.base_interval
            .checked_mul(factor)
            .map_or(self.log_cap, |d| d.min(self.log_cap))
    }
}

/// 二维码输出节流：内容相同或间隔过短则不输出；认证开始后永久抑制
#[derive(Debug)]
pub struct QrThrottle {
    min_interval: Duration,
    last_hash: Option<String>,
    last_shown: Option<Instant>,
    suppressed: bool,
}

impl QrThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_hash: None,
            last_shown: None,
            suppressed: false,
        }
    }

    /// 是否应当显示本次二维码
    pub fn should_show(&mut self, payload: &str) -> bool {
        if self.suppressed {
            return false;
        }
        let hash = format!("{:x}", Sha256::digest(payload.as_bytes()));
        let now = Instant::now();
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            return false;
        }
        if let Some(shown) = self.last_shown {
            if now.saturating_duration_since(shown) < self.min_interval {
                return false;
            }
        }
        self.last_hash = Some(hash);
        self.last_shown = Some(now);
        true
    }

    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    /// 会话被清空后需要重新扫码
    pub fn reset(&mut self) {
        self.last_hash = None;
        self.last_shown = None;
        self.suppressed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_stale_warnings_back_off_and_cap() {
        let mut wd = Watchdog::new(30 * MIN, 5 * MIN, 60 * MIN);
        tokio::time::advance(31 * MIN).await;
        assert!(wd.check().is_some());

        let mut warn_gaps = Vec::new();
        let mut since_last = Duration::ZERO;
        for _ in 0..(12 * 8) {
            tokio::time::advance(5 * MIN).await;
            since_last += 5 * MIN;
            if wd.check().is_some() {
                warn_gaps.push(since_last.as_secs() / 60);
                since_last = Duration::ZERO;
            }
        }
        assert_eq!(&warn_gaps[..5], &[5, 10, 20, 40, 60]);
        assert!(warn_gaps[5..].iter().all(|&g| g == 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_backoff() {
        let mut wd = Watchdog::new(30 * MIN, 5 * MIN, 60 * MIN);
        tokio::time::advance(31 * MIN).await;
        assert!(wd.check().is_some());
        tokio::time::advance(5 * MIN).await;
        assert!(wd.check().is_some());
        assert_eq!(wd.current_backoff(), 20 * MIN);

        wd.touch();
        assert_eq!(wd.current_backoff(), 5 * MIN);
        assert!(wd.check().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_qr_throttle() {
        let mut qr = QrThrottle::new(Duration::from_secs(30));
        assert!(qr.should_show("code-1"));
        assert!(!qr.should_show("code-1"));
        assert!(!qr.should_show("code-2"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(qr.should_show("code-2"));

        qr.suppress();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!qr.should_show("code-3"));

        qr.reset();
        assert!(qr.should_show("code-3"));
    }
}
