//! 熔断保护的后端装饰器

use std::sync::Arc;

use async_trait::async_trait;

use super::{BackendError, BackendReply, BackendRequest, ConversationBackend};
use crate::resilience::{BreakerError, CircuitBreaker};

/// 所有调用经过 [`CircuitBreaker::call_guarded`]：内部重试、超时、失败计数
pub struct GuardedBackend<B> {
    inner: B,
    breaker: Arc<CircuitBreaker>,
}

impl<B: ConversationBackend> GuardedBackend<B> {
    pub fn new(inner: B, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<B: ConversationBackend> ConversationBackend for GuardedBackend<B> {
    async fn process(&self, request: &BackendRequest) -> Result<BackendReply, BackendError> {
        let label = format!("{}.process", self.inner.name());
        self.breaker
            .call_guarded(&label, || self.inner.process(request), BackendError::is_retryable)
            .await
            .map_err(|e| match e {
                BreakerError::Open { remaining, .. } => BackendError::Unavailable {
                    retry_after: remaining,
                },
                BreakerError::HalfOpenSaturated { .. } => BackendError::Unavailable {
                    retry_after: std::time::Duration::ZERO,
                },
                BreakerError::Timeout { after, .. } => BackendError::Timeout { after },
                BreakerError::Inner(inner) => inner,
            })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ContentKind;
    use crate::resilience::{BreakerConfig, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Failing {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ConversationBackend for Failing {
        async fn process(&self, _: &BackendRequest) -> Result<BackendReply, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Fatal("boom".into()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn request() -> BackendRequest {
        BackendRequest {
            sender_id: "1".into(),
            conversation_id: "1@c.us".into(),
            text: "hola".into(),
            timestamp_sec: 0,
            kind: ContentKind::Text,
            deactivation_hint: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_maps_to_unavailable() {
        let breaker = Arc::new(CircuitBreaker::new(
            "llm",
            BreakerConfig {
                retry: RetryPolicy::none(),
                ..BreakerConfig::default()
            },
        ));
        let backend = GuardedBackend::new(
            Failing {
                calls: AtomicU32::new(0),
            },
            breaker.clone(),
        );

        for _ in 0..5 {
            assert!(matches!(
                backend.process(&request()).await,
                Err(BackendError::Fatal(_))
            ));
        }
        match backend.process(&request()).await {
            Err(BackendError::Unavailable { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
        assert_eq!(backend.inner.calls.load(Ordering::SeqCst), 5);
        assert!(breaker.is_open().await);
    }
}
