//! 聊天连接：驱动边界、会话目录、看门狗与连接管理器

pub mod console;
pub mod driver;
pub mod manager;
pub mod profile;
pub mod watchdog;

pub use console::{ConsoleDriver, ConsoleDriverFactory};
pub use driver::{
    ConnectionDriver, DisconnectKind, DisconnectReason, DriverError, DriverEvent, DriverFactory,
    DriverHandle, InboundMessage,
};
pub use manager::{
    AlertLevel, AlertSink, ConnectionError, ConnectionManager, ConnectionState, LogAlertSink,
    ManagerConfig,
};
pub use profile::SessionProfile;
pub use watchdog::{QrThrottle, StalePolicy, Watchdog};
