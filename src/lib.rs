//! Relay - 聊天连接到 LLM 后端的弹性网关
//!
//! 模块划分：
//! - **backend**: 会话后端抽象与实现（OpenAI 兼容 / Echo / 熔断包装）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **connection**: 驱动边界、连接管理器（初始化重试、断连恢复、看门狗）
//! - **core**: 顶层错误、优雅关闭
//! - **gateway**: 去重、限流、会话激活与入站流水线
//! - **observability**: 日志初始化与脱敏
//! - **resilience**: 重试与熔断
//! - **storage**: 临时文件清理
//! - **http**: 健康检查与统计端点（`http` feature）

pub mod backend;
pub mod config;
pub mod connection;
pub mod core;
pub mod gateway;
#[cfg(feature = "http")]
pub mod http;
pub mod observability;
pub mod resilience;
pub mod storage;

pub use config::{load_config, AppConfig};
pub use gateway::Gateway;
