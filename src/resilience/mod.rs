//! 弹性层：指数退避重试与熔断器，供连接初始化、LLM 调用、文件 I/O 共用

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;
