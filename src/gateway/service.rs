//! 网关：把各组件串成入站流水线
//!
//! 入站顺序：去重 → 自发回声 → 授权 → 内容分类 → 限流 → 激活前缀/会话门 → 后端；
//! 出站：先登记自发指纹，再经连接发送。所有外部调用都在锁外完成。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::conversation::ConversationStore;
use super::dedup::Deduplicator;
use super::inbound::{self, AllowList, ContentKind};
use super::rate_limit::RateLimiter;
use crate::backend::{BackendRequest, ConversationBackend};
use crate::connection::{DriverError, InboundMessage};
use crate::observability::mask_pii;
use crate::resilience::{BreakerState, CircuitBreaker};

/// 出站发送能力（由连接管理器实现）
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), DriverError>;
}

/// 网关行为配置
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub bot_prefix: String,
    pub max_text_chars: usize,
    /// 后端失败时的致歉回复，None 表示不回复
    pub error_reply: Option<String>,
    pub too_long_reply: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bot_prefix: "#bot".to_string(),
            max_text_chars: 4000,
            error_reply: None,
            too_long_reply:
                "Lo siento, tu mensaje es muy largo. Por favor, envía mensajes más cortos."
                    .to_string(),
        }
    }
}

/// 一条入站消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "disposition")]
pub enum Disposition {
    Duplicate,
    SelfEcho,
    Unauthorized,
    /// 不支持的类型、空文本、只有前缀
    Invalid,
    Inactive,
    RateLimited,
    TooLong,
    Handled { replied: bool, deactivated: bool },
    BackendFailed,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    duplicate: AtomicU64,
    self_echo: AtomicU64,
    unauthorized: AtomicU64,
    invalid: AtomicU64,
    inactive: AtomicU64,
    rate_limited: AtomicU64,
    too_long: AtomicU64,
    handled: AtomicU64,
    replies_sent: AtomicU64,
    send_failures: AtomicU64,
    backend_failures: AtomicU64,
}

/// 运行统计
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub received: u64,
    pub duplicate: u64,
    pub self_echo: u64,
    pub unauthorized: u64,
    pub invalid: u64,
    pub inactive: u64,
    pub rate_limited: u64,
    pub too_long: u64,
    pub handled: u64,
    pub replies_sent: u64,
    pub send_failures: u64,
    pub backend_failures: u64,
    pub active_conversations: usize,
    pub tracked_senders: usize,
    pub processed_ids: usize,
    pub backend_breaker: Option<BreakerState>,
}

pub struct Gateway {
    settings: GatewaySettings,
    allow_list: AllowList,
    dedup: Arc<Deduplicator>,
    limiter: Arc<RateLimiter>,
    conversations: Arc<ConversationStore>,
    backend: Arc<dyn ConversationBackend>,
    sender: Arc<dyn OutboundSender>,
    backend_breaker: Option<Arc<CircuitBreaker>>,
    counters: Counters,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: GatewaySettings,
        allow_list: AllowList,
        dedup: Arc<Deduplicator>,
        limiter: Arc<RateLimiter>,
        conversations: Arc<ConversationStore>,
        backend: Arc<dyn ConversationBackend>,
        sender: Arc<dyn OutboundSender>,
    ) -> Self {
        Self {
            settings,
            allow_list,
            dedup,
            limiter,
            conversations,
            backend,
            sender,
            backend_breaker: None,
            counters: Counters::default(),
        }
    }

    /// 关联后端熔断器，用于统计与就绪判断
    pub fn with_backend_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.backend_breaker = Some(breaker);
        self
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// 处理一条入站消息
    pub async fn handle(&self, msg: InboundMessage) -> Disposition {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let disposition = self.route(&msg).await;
        self.count(&disposition);
        disposition
    }

    async fn route(&self, msg: &InboundMessage) -> Disposition {
        if !self.dedup.check_and_mark(&msg.id).await {
            tracing::debug!(id = %msg.id, "Duplicate message dropped");
            return Disposition::Duplicate;
        }

        if msg.from_self && self.dedup.is_echo(&msg.to, &msg.body).await {
            tracing::debug!(id = %msg.id, "Self-echo dropped");
            return Disposition::SelfEcho;
        }

        let sender_id = inbound::normalize_sender(&msg.from);
        let chat_id = msg.chat_id().to_string();
        let masked = mask_pii(&sender_id);

        // 本账号发出的消息同样校验发送方
        if !self.allow_list.allows(&msg.from) {
            tracing::warn!(sender = %masked, "Unauthorized sender, ignoring");
            return Disposition::Unauthorized;
        }

        let kind = match inbound::classify(msg) {
            Some(kind) => kind,
            None => {
                tracing::debug!(id = %msg.id, msg_type = %msg.msg_type, "Unsupported or empty message");
                return Disposition::Invalid;
            }
        };

        if !kind.is_text() && !self.conversations.is_active(&chat_id).await {
            tracing::debug!(?kind, "Media in inactive conversation dropped");
            return Disposition::Inactive;
        }

        if !self.limiter.try_admit(&sender_id).await {
            tracing::warn!(sender = %masked, "Rate limit exceeded");
            return Disposition::RateLimited;
        }

        let text = if kind.is_text() {
            let body = msg.body.trim();
            let stripped = inbound::strip_prefix(body, &self.settings.bot_prefix);
            match stripped {
                Some("") => return Disposition::Invalid,
                Some(rest) => {
                    if self.too_long(rest) {
                        return self.reply_too_long(&chat_id, &masked).await;
                    }
                    self.conversations.activate(&chat_id).await;
                    tracing::info!(chat = %mask_pii(&chat_id), sender = %masked, "Conversation activated");
                    rest.to_string()
                }
                None => {
                    if !self.conversations.is_active(&chat_id).await {
                        return Disposition::Inactive;
                    }
                    if self.too_long(body) {
                        return self.reply_too_long(&chat_id, &masked).await;
                    }
                    body.to_string()
                }
            }
        } else {
            msg.body.trim().to_string()
        };

        self.dispatch(msg, sender_id, chat_id, kind, text).await
    }

    async fn dispatch(
        &self,
        msg: &InboundMessage,
        sender_id: String,
        chat_id: String,
        kind: ContentKind,
        text: String,
    ) -> Disposition {
        let request = BackendRequest {
            deactivation_hint: kind.is_text() && inbound::is_deactivation_request(&text),
            sender_id,
            conversation_id: chat_id.clone(),
            text,
            timestamp_sec: msg.timestamp,
            kind,
        };
        tracing::info!(
            chat = %mask_pii(&chat_id),
            ?kind,
            "Forwarding message to {}",
            self.backend.name()
        );

        match self.backend.process(&request).await {
            Ok(reply) => {
                if reply.should_deactivate {
                    self.conversations.deactivate(&chat_id).await;
                    tracing::info!(chat = %mask_pii(&chat_id), "Conversation deactivated");
                }
                let replied = match reply.reply.as_deref() {
                    Some(text) if !text.trim().is_empty() => self.send_reply(&chat_id, text).await,
                    _ => false,
                };
                Disposition::Handled {
                    replied,
                    deactivated: reply.should_deactivate,
                }
            }
            Err(e) => {
                tracing::error!(chat = %mask_pii(&chat_id), "Backend failed: {}", e);
                if let Some(apology) = self.settings.error_reply.clone() {
                    self.send_reply(&chat_id, &apology).await;
                }
                Disposition::BackendFailed
            }
        }
    }

    fn too_long(&self, text: &str) -> bool {
        text.chars().count() > self.settings.max_text_chars
    }

    async fn reply_too_long(&self, chat_id: &str, masked_sender: &str) -> Disposition {
        tracing::warn!(sender = %masked_sender, "Message too long");
        let reply = self.settings.too_long_reply.clone();
        self.send_reply(chat_id, &reply).await;
        Disposition::TooLong
    }

    /// 登记自发指纹后发送；返回是否发送成功
    pub async fn send_reply(&self, chat_id: &str, text: &str) -> bool {
        self.dedup.register_outbound(chat_id, text).await;
        match self.sender.send_text(chat_id, text).await {
            Ok(()) => {
                self.counters.replies_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(chat = %mask_pii(chat_id), "Failed to send reply: {}", e);
                false
            }
        }
    }

    fn count(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Duplicate => &self.counters.duplicate,
            Disposition::SelfEcho => &self.counters.self_echo,
            Disposition::Unauthorized => &self.counters.unauthorized,
            Disposition::Invalid => &self.counters.invalid,
            Disposition::Inactive => &self.counters.inactive,
            Disposition::RateLimited => &self.counters.rate_limited,
            Disposition::TooLong => &self.counters.too_long,
            Disposition::Handled { .. } => &self.counters.handled,
            Disposition::BackendFailed => &self.counters.backend_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> GatewayStats {
        let c = &self.counters;
        let backend_breaker = match &self.backend_breaker {
            Some(b) => Some(b.state().await),
            None => None,
        };
        GatewayStats {
            received: c.received.load(Ordering::Relaxed),
            duplicate: c.duplicate.load(Ordering::Relaxed),
            self_echo: c.self_echo.load(Ordering::Relaxed),
            unauthorized: c.unauthorized.load(Ordering::Relaxed),
            invalid: c.invalid.load(Ordering::Relaxed),
            inactive: c.inactive.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            too_long: c.too_long.load(Ordering::Relaxed),
            handled: c.handled.load(Ordering::Relaxed),
            replies_sent: c.replies_sent.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            backend_failures: c.backend_failures.load(Ordering::Relaxed),
            active_conversations: self.conversations.count().await,
            tracked_senders: self.limiter.tracked_keys().await,
            processed_ids: self.dedup.seen_count().await,
            backend_breaker,
        }
    }

    /// 后端是否可用（熔断器未打开）
    pub async fn backend_available(&self) -> bool {
        match &self.backend_breaker {
            Some(b) => !b.is_open().await,
            None => true,
        }
    }

    /// 消费入站通道；每条消息独立处理，不同会话的发送可以并发
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        tracing::info!("Gateway started (prefix {:?})", self.settings.bot_prefix);
        while let Some(msg) = inbound.recv().await {
            let gateway = self.clone();
            tokio::spawn(async move {
                gateway.handle(msg).await;
            });
        }
        tracing::info!("Gateway inbound channel closed");
    }
}
