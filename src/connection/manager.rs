//! 连接管理器：持有唯一的驱动实例，负责初始化重试、断连恢复与看门狗
//!
//! 生命周期：
//! - 初始化在独立任务中进行（带退避重试），关闭时可直接中止
//! - 软断连：沿用本地会话目录重新初始化；初始化已在进行时不重复启动
//! - 硬失效：中止初始化 → 销毁驱动 → 删除会话目录 → 新建驱动并接管事件流 → 重新初始化
//! - 每个驱动实例有自己的代号，旧实例迟到的事件直接丢弃
//! - 初始化重试耗尽是唯一的致命错误，经 [`ConnectionManager::run`] 返回给宿主

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::driver::{ConnectionDriver, DisconnectReason, DriverError, DriverEvent, DriverFactory};
use super::profile::SessionProfile;
use super::watchdog::{QrThrottle, StalePolicy, Watchdog};
use super::InboundMessage;
use crate::gateway::OutboundSender;
use crate::resilience::RetryPolicy;

/// 连接状态，仅由管理器修改
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    /// 等待扫码 / 同步中，仅供展示
    Authenticating,
    Ready,
    Degraded,
    Destroying,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection initialization failed after {attempts} attempt(s): {source}")]
    InitExhausted {
        attempts: u32,
        #[source]
        source: DriverError,
    },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Connection manager is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// 运维告警出口
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, level: AlertLevel, message: &str);
}

/// 默认告警：写入 `relay::alert` 日志目标
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Warning => tracing::warn!(target: "relay::alert", "{}", message),
            AlertLevel::Critical => tracing::error!(target: "relay::alert", "{}", message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub session_dir: std::path::PathBuf,
    pub init_retry: RetryPolicy,
    pub watchdog_interval: Duration,
    pub stale_threshold: Duration,
    pub watchdog_log_cap: Duration,
    pub stale_policy: StalePolicy,
    pub qr_min_interval: Duration,
    pub destroy_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_dir: std::path::PathBuf::from("./session"),
            init_retry: RetryPolicy::new(4, Duration::from_millis(1000), Duration::from_secs(15)),
            watchdog_interval: Duration::from_secs(5 * 60),
            stale_threshold: Duration::from_secs(30 * 60),
            watchdog_log_cap: Duration::from_secs(60 * 60),
            stale_policy: StalePolicy::LogOnly,
            qr_min_interval: Duration::from_secs(30),
            destroy_timeout: Duration::from_secs(10),
        }
    }
}

type InitHandle = JoinHandle<Result<(), ConnectionError>>;

pub struct ConnectionManager {
    config: ManagerConfig,
    factory: Arc<dyn DriverFactory>,
    profile: SessionProfile,
    alerts: Arc<dyn AlertSink>,
    driver: RwLock<Option<Arc<dyn ConnectionDriver>>>,
    generation: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<(u64, DriverEvent)>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, DriverEvent)>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn DriverFactory>,
        alerts: Arc<dyn AlertSink>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            profile: SessionProfile::new(config.session_dir.clone()),
            config,
            factory,
            alerts,
            driver: RwLock::new(None),
            generation: AtomicU64::new(0),
            pump: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state_tx,
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn profile(&self) -> &SessionProfile {
        &self.profile
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::info!("Connection state: {:?} -> {:?}", prev, next);
        }
    }

    async fn current_driver(&self) -> Option<Arc<dyn ConnectionDriver>> {
        self.driver.read().await.clone()
    }

    /// 新建驱动并接管它的事件流
    async fn install_driver(&self) -> Result<(), DriverError> {
        let handle = self.factory.create(self.profile.dir())?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let tx = self.events_tx.clone();
        let mut events = handle.events;
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((generation, event)).is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.pump.lock().await.replace(pump) {
            old.abort();
        }
        *self.driver.write().await = Some(handle.driver);
        tracing::debug!("Driver generation {} installed", generation);
        Ok(())
    }

    /// 销毁当前驱动（带超时），此后旧实例的事件一律丢弃
    async fn destroy_current(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        let old = self.driver.write().await.take();
        if let Some(driver) = old {
            match tokio::time::timeout(self.config.destroy_timeout, driver.destroy()).await {
                Ok(Ok(())) => tracing::debug!("Driver destroyed"),
                Ok(Err(e)) => tracing::warn!("Driver destroy failed: {}", e),
                Err(_) => tracing::warn!(
                    "Driver destroy timed out after {}s",
                    self.config.destroy_timeout.as_secs()
                ),
            }
        }
    }

    async fn initialize_once(&self) -> Result<(), DriverError> {
        self.profile.remove_stale_locks().await;
        let driver = self.current_driver().await.ok_or(DriverError::NotConnected)?;
        driver.initialize().await
    }

    /// 带重试的初始化；锁冲突时清空会话目录并重建驱动，仅一次
    async fn initialize_with_retry(self: Arc<Self>) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Initializing);
        let policy = self.config.init_retry;
        let mut wiped_for_lock = false;
        let mut attempts = 0u32;
        loop {
            let result = policy
                .execute(
                    "connection.initialize",
                    || {
                        attempts += 1;
                        self.initialize_once()
                    },
                    // 导航竞争等错误都计入次数并重试；锁冲突交给下面的清理分支
                    |e: &DriverError| !e.is_profile_locked(),
                )
                .await;
            match result {
                Ok(()) => {
                    tracing::info!("Connection initialized");
                    return Ok(());
                }
                Err(e) if e.is_profile_locked() && !wiped_for_lock => {
                    wiped_for_lock = true;
                    tracing::warn!("Session profile locked ({}), wiping and retrying", e);
                    self.destroy_current().await;
                    self.profile.wipe().await;
                    self.install_driver().await?;
                }
                Err(e) => {
                    return Err(ConnectionError::InitExhausted {
                        attempts,
                        source: e,
                    })
                }
            }
        }
    }

    fn spawn_init(self: &Arc<Self>) -> InitHandle {
        let this = self.clone();
        tokio::spawn(this.initialize_with_retry())
    }

    /// 硬失效恢复：删除会话目录后从头初始化
    async fn recover_hard(self: &Arc<Self>, init: &mut Option<InitHandle>) -> Result<(), ConnectionError> {
        if let Some(handle) = init.take() {
            handle.abort();
        }
        self.destroy_current().await;
        if self.profile.wipe().await {
            tracing::info!("Invalidated session removed, re-initializing from scratch");
        }
        self.install_driver().await?;
        *init = Some(self.spawn_init());
        Ok(())
    }

    async fn shutdown_driver(&self, init: Option<InitHandle>) {
        self.set_state(ConnectionState::Destroying);
        if let Some(handle) = init {
            handle.abort();
        }
        self.destroy_current().await;
        tracing::info!("Connection manager stopped");
    }

    /// 运行直到关闭或初始化彻底失败；收到的消息转发到 `inbound`
    pub async fn run(
        self: Arc<Self>,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<(), ConnectionError> {
        let mut events = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(ConnectionError::AlreadyRunning)?;

        self.install_driver().await?;

        let mut watchdog = Watchdog::new(
            self.config.stale_threshold,
            self.config.watchdog_interval,
            self.config.watchdog_log_cap,
        );
        let mut qr = QrThrottle::new(self.config.qr_min_interval);
        let period = self.config.watchdog_interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut init = Some(self.spawn_init());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.shutdown_driver(init.take()).await;
                    return Ok(());
                }
                joined = join_init(&mut init) => {
                    init = None;
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(self.fail(e).await),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            let err = ConnectionError::Driver(DriverError::Other(format!(
                                "initialization task panicked: {}",
                                e
                            )));
                            return Err(self.fail(err).await);
                        }
                    }
                }
                Some((generation, event)) = events.recv() => {
                    if generation != self.generation.load(Ordering::SeqCst) {
                        tracing::debug!("Dropping {} event from retired driver", event.name());
                        continue;
                    }
                    watchdog.touch();
                    if let Err(e) = self.on_event(event, &inbound, &mut qr, &mut init).await {
                        return Err(self.fail(e).await);
                    }
                }
                _ = ticker.tick() => {
                    if let Some(idle) = watchdog.check() {
                        tracing::warn!(
                            "No connection events for {} min (state {:?}), next warning in {} min",
                            idle.as_secs() / 60,
                            self.state(),
                            watchdog.current_backoff().as_secs() / 60
                        );
                        if self.config.stale_policy == StalePolicy::Reconnect && init.is_none() {
                            tracing::warn!("Stale connection, re-initializing");
                            init = Some(self.spawn_init());
                        }
                    }
                }
            }
        }
    }

    async fn on_event(
        self: &Arc<Self>,
        event: DriverEvent,
        inbound: &mpsc::Sender<InboundMessage>,
        qr: &mut QrThrottle,
        init: &mut Option<InitHandle>,
    ) -> Result<(), ConnectionError> {
        match event {
            DriverEvent::Qr(payload) => {
                self.set_state(ConnectionState::Authenticating);
                if qr.should_show(&payload) {
                    tracing::info!("Scan the QR code to link the session:\n{}", payload);
                }
            }
            DriverEvent::Loading(percent) => {
                self.set_state(ConnectionState::Authenticating);
                tracing::info!("Loading session: {}%", percent);
            }
            DriverEvent::Authenticated => {
                qr.suppress();
                self.set_state(ConnectionState::Authenticating);
                tracing::info!("Session authenticated");
            }
            DriverEvent::Ready => {
                self.set_state(ConnectionState::Ready);
            }
            DriverEvent::StateChanged(state) => {
                tracing::info!("Driver state changed: {}", state);
            }
            DriverEvent::Message(msg) => {
                if inbound.send(msg).await.is_err() {
                    tracing::warn!("Inbound channel closed, dropping message");
                }
            }
            DriverEvent::AuthFailure(reason) => {
                self.alerts
                    .alert(AlertLevel::Critical, &format!("Authentication failure: {}", reason))
                    .await;
            }
            DriverEvent::Disconnected(reason) => {
                self.on_disconnect(reason, qr, init).await?;
            }
        }
        Ok(())
    }

    async fn on_disconnect(
        self: &Arc<Self>,
        reason: DisconnectReason,
        qr: &mut QrThrottle,
        init: &mut Option<InitHandle>,
    ) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Degraded);
        self.alerts
            .alert(
                AlertLevel::Warning,
                &format!("Connection lost: {} ({:?})", reason.raw, reason.kind),
            )
            .await;

        if reason.is_hard() {
            qr.reset();
            return self.recover_hard(init).await;
        }

        if init.as_ref().map_or(false, |h| !h.is_finished()) {
            tracing::info!("Initialization already in progress, not restarting");
        } else {
            tracing::info!("Re-initializing with existing session");
            *init = Some(self.spawn_init());
        }
        Ok(())
    }

    async fn fail(&self, err: ConnectionError) -> ConnectionError {
        self.alerts
            .alert(AlertLevel::Critical, &format!("Connection manager giving up: {}", err))
            .await;
        self.set_state(ConnectionState::Degraded);
        self.destroy_current().await;
        err
    }
}

async fn join_init(
    init: &mut Option<InitHandle>,
) -> Result<Result<(), ConnectionError>, tokio::task::JoinError> {
    match init {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl OutboundSender for ConnectionManager {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), DriverError> {
        let driver = self.current_driver().await.ok_or(DriverError::NotConnected)?;
        driver.send(chat_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_alert_sink_does_not_panic() {
        LogAlertSink.alert(AlertLevel::Warning, "disconnected").await;
        LogAlertSink.alert(AlertLevel::Critical, "giving up").await;
    }

    #[test]
    fn test_default_init_policy() {
        let config = ManagerConfig::default();
        // 共 5 次尝试，等待上限 15s
        assert_eq!(config.init_retry.max_retries + 1, 5);
        assert_eq!(config.init_retry.delay_for(10), Duration::from_secs(15));
    }
}
