//! 控制台驱动：标准输入作为入站消息，回复打印到标准输出
//!
//! 本地联调用，无需浏览器与扫码。

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::driver::{
    ConnectionDriver, DriverError, DriverEvent, DriverFactory, DriverHandle, InboundMessage,
};

pub struct ConsoleDriver {
    sender: String,
    account: String,
    events: mpsc::UnboundedSender<DriverEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
    counter: Arc<AtomicU64>,
}

impl ConsoleDriver {
    pub fn new(
        sender: impl Into<String>,
        account: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Self {
            sender: sender.into(),
            account: account.into(),
            events: tx,
            reader: Mutex::new(None),
            counter: Arc::new(AtomicU64::new(0)),
        };
        (driver, rx)
    }

    fn spawn_reader(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let sender = self.sender.clone();
        let account = self.account.clone();
        let counter = self.counter.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let n = counter.fetch_add(1, Ordering::Relaxed);
                        let msg = InboundMessage {
                            id: format!("console-{}", n),
                            from: sender.clone(),
                            to: account.clone(),
                            from_self: false,
                            msg_type: "chat".to_string(),
                            body: line,
                            has_media: false,
                            timestamp: chrono::Utc::now().timestamp(),
                        };
                        if events.send(DriverEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Console input closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Console read error: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ConnectionDriver for ConsoleDriver {
    async fn initialize(&self) -> Result<(), DriverError> {
        let mut reader = self.reader.lock().await;
        if reader.as_ref().map_or(true, |h| h.is_finished()) {
            *reader = Some(self.spawn_reader());
        }
        for event in [DriverEvent::Loading(100), DriverEvent::Authenticated, DriverEvent::Ready] {
            self.events
                .send(event)
                .map_err(|_| DriverError::Other("event receiver dropped".into()))?;
        }
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), DriverError> {
        let line = format!("[{}] {}\n", chat_id, text);
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DriverError::Send(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| DriverError::Send(e.to_string()))
    }

    async fn destroy(&self) -> Result<(), DriverError> {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

/// 控制台驱动工厂；会话目录对控制台无意义，忽略
pub struct ConsoleDriverFactory {
    sender: String,
    account: String,
}

impl ConsoleDriverFactory {
    pub fn new(sender: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            account: account.into(),
        }
    }
}

impl DriverFactory for ConsoleDriverFactory {
    fn create(&self, _session_dir: &Path) -> Result<DriverHandle, DriverError> {
        let (driver, events) = ConsoleDriver::new(self.sender.clone(), self.account.clone());
        Ok(DriverHandle {
            driver: Arc::new(driver),
            events,
        })
    }
}
