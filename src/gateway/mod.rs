//! 消息网关
//!
//! 入站流水线上的各个组件，每个组件独占自己的状态，只暴露原子操作：
//! - **dedup**: 已处理消息 ID 去重、自发回声识别
//! - **rate_limit**: 按发送方的滑动窗口限流
//! - **conversation**: 按会话的激活状态（带过期）
//! - **inbound**: 授权、内容分类、激活前缀与退出关键词
//! - **service**: 组合以上组件的 [`Gateway`]

pub mod conversation;
pub mod dedup;
pub mod inbound;
pub mod rate_limit;
pub mod service;

pub use conversation::ConversationStore;
pub use dedup::{DedupConfig, Deduplicator};
pub use inbound::{AllowList, ContentKind};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use service::{Disposition, Gateway, GatewaySettings, GatewayStats, OutboundSender};
