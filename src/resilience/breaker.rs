//! 熔断器
//!
//! 滑动窗口内失败次数达到阈值即打开，冷却期内直接拒绝调用（不执行被保护的操作）；
//! 冷却结束后在调用时隐式进入半开状态，放行有限数量的试探请求，成功则关闭、失败则重新打开。
//! 内部组合 RetryPolicy：一次调用在重试耗尽后才记为一次失败。

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use super::retry::RetryPolicy;

/// 熔断器配置
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// 窗口内失败次数阈值
    pub failure_threshold: usize,
    /// 失败统计窗口
    pub failure_window: Duration,
    /// 打开后的冷却时间
    pub cooldown: Duration,
    /// 半开状态下允许的并发试探请求数
    pub half_open_max_requests: u32,
    /// 单次尝试的超时；超时按失败处理
    pub call_timeout: Option<Duration>,
    /// 内部重试策略
    pub retry: RetryPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            half_open_max_requests: 3,
            call_timeout: Some(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
        }
    }
}

/// 对外展示的熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// 受保护调用的错误
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// 熔断打开，调用方不应立即重试
    #[error("{name} breaker open, retry after {}ms", .remaining.as_millis())]
    Open { name: String, remaining: Duration },

    #[error("{name} breaker half-open trial limit reached")]
    HalfOpenSaturated { name: String },

    #[error("{name} call timed out after {}ms", .after.as_millis())]
    Timeout { name: String, after: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// 熔断拒绝时建议的等待时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BreakerError::Open { remaining, .. } => Some(*remaining),
            BreakerError::HalfOpenSaturated { .. } => Some(Duration::ZERO),
            _ => None,
        }
    }

    /// 是否为熔断器本身拒绝（未执行操作）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BreakerError::Open { .. } | BreakerError::HalfOpenSaturated { .. }
        )
    }
}

/// 半开状态下占用的试探名额；未结算就被丢弃时（调用方超时、任务中止）自动归还
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    cycle: u64,
    settled: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_trial(self.cycle);
        }
    }
}

enum Admission<'a> {
    Normal,
    Trial(TrialSlot<'a>),
}

#[derive(Debug, Default)]
struct BreakerInner {
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    /// 每次打开加一；试探请求只对自己所属的打开周期生效
    cycle: u64,
    trials_in_flight: u32,
}

impl BreakerInner {
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant, cooldown: Duration) {
        self.open_until = Some(now + cooldown);
        self.cycle += 1;
        self.trials_in_flight = 0;
    }

    /// 试探是否仍属于当前半开周期
    fn is_current_trial(&self, cycle: u64, now: Instant) -> bool {
        self.cycle == cycle && self.open_until.map_or(false, |until| now >= until)
    }
}

/// 通用熔断器：LLM 调用与文件 I/O 各持一个实例
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // 临界区内不跨 await，用同步锁以便在 Drop 中归还试探名额
    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 执行受保护的调用
    pub async fn call_guarded<T, E, F, Fut, R>(
        &self,
        label: &str,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let admission = self.admit::<E>()?;
        let timeout = self.config.call_timeout;

        let result = self
            .config
            .retry
            .execute(
                label,
                || {
                    let fut = operation();
                    let name = self.name.clone();
                    async move {
                        match timeout {
                            Some(after) => match tokio::time::timeout(after, fut).await {
                                Ok(r) => r.map_err(BreakerError::Inner),
                                Err(_) => Err(BreakerError::Timeout { name, after }),
                            },
                            None => fut.await.map_err(BreakerError::Inner),
                        }
                    }
                },
                |e: &BreakerError<E>| match e {
                    BreakerError::Timeout { .. } => true,
                    BreakerError::Inner(inner) => is_retryable(inner),
                    _ => false,
                },
            )
            .await;

        match &result {
            Ok(_) => self.on_success(admission),
            Err(e) => self.on_failure(admission, label, e),
        }
        result
    }

    fn admit<E>(&self) -> Result<Admission<'_>, BreakerError<E>> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.open_until {
            Some(until) if now < until => Err(BreakerError::Open {
                name: self.name.clone(),
                remaining: until - now,
            }),
            Some(_) => {
                if inner.trials_in_flight >= self.config.half_open_max_requests {
                    tracing::warn!("{} breaker: half-open trial limit reached", self.name);
                    return Err(BreakerError::HalfOpenSaturated {
                        name: self.name.clone(),
                    });
                }
                if inner.trials_in_flight == 0 {
                    tracing::info!("{} breaker: cooldown elapsed, half-open", self.name);
                }
                inner.trials_in_flight += 1;
                Ok(Admission::Trial(TrialSlot {
                    breaker: self,
                    cycle: inner.cycle,
                    settled: false,
                }))
            }
            None => Ok(Admission::Normal),
        }
    }

    fn release_trial(&self, cycle: u64) {
        let mut inner = self.lock();
        if inner.cycle == cycle {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            tracing::debug!("{} breaker: abandoned trial released", self.name);
        }
    }

    fn on_success(&self, admission: Admission<'_>) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.purge(now, self.config.failure_window);
        if let Admission::Trial(mut slot) = admission {
            slot.settled = true;
            if inner.is_current_trial(slot.cycle, now) {
                inner.failures.clear();
                inner.open_until = None;
                inner.trials_in_flight = 0;
                tracing::info!("{} breaker closed after successful trial", self.name);
            } else {
                tracing::debug!("{} breaker: late trial success ignored", self.name);
            }
        }
    }

    fn on_failure<E: Display>(&self, admission: Admission<'_>, label: &str, error: &BreakerError<E>) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.failures.push_back(now);
        inner.purge(now, self.config.failure_window);

        let current_trial = match admission {
            Admission::Trial(mut slot) => {
                slot.settled = true;
                inner.is_current_trial(slot.cycle, now)
            }
            Admission::Normal => false,
        };
        let already_open = inner.open_until.map_or(false, |until| now < until);

        if current_trial {
            inner.open(now, self.config.cooldown);
            tracing::error!(
                "{} breaker re-opened for {}ms, trial {} failed: {}",
                self.name,
                self.config.cooldown.as_millis(),
                label,
                error
            );
        } else if inner.open_until.is_none() && inner.failures.len() >= self.config.failure_threshold {
            inner.open(now, self.config.cooldown);
            tracing::error!(
                "{} breaker OPEN for {}ms ({} failures in last {}ms), last error: {}",
                self.name,
                self.config.cooldown.as_millis(),
                inner.failures.len(),
                self.config.failure_window.as_millis(),
                error
            );
        } else if !already_open {
            tracing::warn!(
                "{} breaker: {} failed ({}/{}): {}",
                self.name,
                label,
                inner.failures.len(),
                self.config.failure_threshold,
                error
            );
        }
    }

    /// 当前状态（半开为调用时隐式判定）
    pub async fn state(&self) -> BreakerState {
        let now = Instant::now();
        match self.lock().open_until {
            None => BreakerState::Closed,
            Some(until) if now < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
        }
    }

    /// 供就绪探针使用：冷却期内为 true
    pub async fn is_open(&self) -> bool {
        self.state().await == BreakerState::Open
    }

    /// 窗口内的失败次数
    pub async fn failure_count(&self) -> usize {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .failures
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < self.config.failure_window)
            .count()
    }
}
