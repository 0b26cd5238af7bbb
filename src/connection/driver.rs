//! 连接驱动边界
//!
//! 驱动本身（浏览器自动化）不在本 crate 内，这里只定义它暴露的能力与事件，
//! 并在边界处把原始断连原因、错误文本一次性归类为枚举。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// 驱动错误
#[derive(Debug, Error)]
pub enum DriverError {
    /// 页面导航导致执行上下文被销毁，始终视为可重试
    #[error("Navigation race: {0}")]
    NavigationRace(String),

    /// 会话目录被其他进程占用
    #[error("Profile locked: {0}")]
    ProfileLocked(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// 从驱动给出的错误文本归类
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("execution context was destroyed") {
            Self::NavigationRace(message)
        } else if lower.contains("singletonlock")
            || lower.contains("profile appears to be in use")
            || lower.contains("already running")
            || lower.contains("lockfile")
        {
            Self::ProfileLocked(message)
        } else {
            Self::Other(message)
        }
    }

    pub fn is_navigation_race(&self) -> bool {
        matches!(self, Self::NavigationRace(_))
    }

    pub fn is_profile_locked(&self) -> bool {
        matches!(self, Self::ProfileLocked(_))
    }
}

/// 断连类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectKind {
    /// 登出、解绑、需要重新同步：本地会话已失效
    HardInvalidation,
    /// 其他原因（网络抖动等）：沿用本地会话
    SoftDisconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub raw: String,
    pub kind: DisconnectKind,
}

impl DisconnectReason {
    pub fn classify(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let upper = raw.to_uppercase();
        let kind = if ["LOGOUT", "UNPAIRED", "DATA_SYNC"]
            .iter()
            .any(|signal| upper.contains(signal))
        {
            DisconnectKind::HardInvalidation
        } else {
            DisconnectKind::SoftDisconnect
        };
        Self { raw, kind }
    }

    pub fn is_hard(&self) -> bool {
        self.kind == DisconnectKind::HardInvalidation
    }
}

/// 驱动上报的一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub from_self: bool,
    /// 驱动给出的原始类型：chat / image / audio / ptt / ...
    pub msg_type: String,
    pub body: String,
    pub has_media: bool,
    /// 秒级时间戳
    pub timestamp: i64,
}

impl InboundMessage {
    /// 会话 ID：本账号发出的消息归属接收方，否则归属发送方
    pub fn chat_id(&self) -> &str {
        if self.from_self {
            &self.to
        } else {
            &self.from
        }
    }
}

/// 驱动事件
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Qr(String),
    Loading(u8),
    Authenticated,
    Ready,
    StateChanged(String),
    Message(InboundMessage),
    Disconnected(DisconnectReason),
    AuthFailure(String),
}

impl DriverEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Qr(_) => "qr",
            Self::Loading(_) => "loading",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::StateChanged(_) => "state_changed",
            Self::Message(_) => "message",
            Self::Disconnected(_) => "disconnected",
            Self::AuthFailure(_) => "auth_failure",
        }
    }
}

/// 连接驱动
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// 启动并连接；完成后事件通过创建时返回的通道送达
    async fn initialize(&self) -> Result<(), DriverError>;

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), DriverError>;

    async fn destroy(&self) -> Result<(), DriverError>;
}

/// 新建的驱动与它的事件流
pub struct DriverHandle {
    pub driver: Arc<dyn ConnectionDriver>,
    pub events: mpsc::UnboundedReceiver<DriverEvent>,
}

/// 驱动工厂：硬失效恢复时需要重新创建驱动
pub trait DriverFactory: Send + Sync {
    fn create(&self, session_dir: &Path) -> Result<DriverHandle, DriverError>;
}
