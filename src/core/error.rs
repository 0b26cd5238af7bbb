//! 顶层错误类型

use thiserror::Error;

use crate::backend::BackendError;
use crate::connection::{ConnectionError, DriverError};

/// 进程级错误：各组件错误在这里汇总，交给宿主决定是否告警退出
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// 是否应终止进程（只有连接初始化彻底失败属于此类）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError::InitExhausted { .. }) | Self::Config(_)
        )
    }
}
