//! 核心：顶层错误与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::RelayError;
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
