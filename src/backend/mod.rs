//! 会话后端（协作方）
//!
//! 网关只负责把规范化后的文本交给后端，回复与是否结束会话由后端决定。
//! - [`OpenAiBackend`]: OpenAI 兼容端点，按会话保留有限历史
//! - [`EchoBackend`]: 无 API Key 时本地联调用
//! - [`GuardedBackend`]: 用熔断器包装任意后端

pub mod echo;
pub mod guarded;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::ContentKind;

pub use echo::EchoBackend;
pub use guarded::GuardedBackend;
pub use openai::OpenAiBackend;

/// 交给后端的一条请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub sender_id: String,
    pub conversation_id: String,
    pub text: String,
    pub timestamp_sec: i64,
    pub kind: ContentKind,
    /// 文本带退出关键词；是否真的结束会话由后端决定
    pub deactivation_hint: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendReply {
    pub reply: Option<String>,
    pub should_deactivate: bool,
}

impl BackendReply {
    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            should_deactivate: false,
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn deactivate(mut self) -> Self {
        self.should_deactivate = true;
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// 网络重置、5xx、429 等，可重试
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Backend error: {0}")]
    Fatal(String),

    /// 熔断器打开，调用方不应立即重试
    #[error("Backend unavailable, retry after {}ms", retry_after.as_millis())]
    Unavailable { retry_after: Duration },

    #[error("Backend call timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }

    /// 按错误文本归类：限流、5xx、网络重置与超时视为暂时性错误
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let transient = [
            "429",
            "rate limit",
            "500",
            "502",
            "503",
            "504",
            "econnreset",
            "connection reset",
            "connection closed",
            "error sending request",
            "timed out",
            "timeout",
            "overloaded",
        ]
        .iter()
        .any(|p| lower.contains(p));
        if transient {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }
}

/// 会话后端
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn process(&self, request: &BackendRequest) -> Result<BackendReply, BackendError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient() {
        assert!(BackendError::classify("status 503 Service Unavailable").is_retryable());
        assert!(BackendError::classify("Rate limit reached for requests").is_retryable());
        assert!(BackendError::classify("read ECONNRESET").is_retryable());
        assert!(!BackendError::classify("invalid api key").is_retryable());
        assert!(!BackendError::Unavailable {
            retry_after: Duration::from_secs(1)
        }
        .is_retryable());
    }
}
