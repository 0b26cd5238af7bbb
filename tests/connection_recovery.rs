//! 连接管理器恢复流程：初始化重试、硬失效清理、软断连、锁冲突、关闭

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay::connection::{
    AlertLevel, AlertSink, ConnectionDriver, ConnectionError, ConnectionManager, ConnectionState,
    DisconnectReason, DriverError, DriverEvent, DriverFactory, DriverHandle, InboundMessage,
    ManagerConfig, StalePolicy,
};
use relay::gateway::OutboundSender;
use relay::resilience::RetryPolicy;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct World {
    created: AtomicU32,
    init_calls: AtomicU32,
    destroyed: AtomicU32,
    transient_failures: AtomicU32,
    lock_failures: AtomicU32,
    senders: Mutex<Vec<mpsc::UnboundedSender<DriverEvent>>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl World {
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn latest(&self) -> mpsc::UnboundedSender<DriverEvent> {
        self.senders.lock().unwrap().last().cloned().unwrap()
    }

    fn first(&self) -> mpsc::UnboundedSender<DriverEvent> {
        self.senders.lock().unwrap()[0].clone()
    }
}

struct FakeDriver {
    world: Arc<World>,
    events: mpsc::UnboundedSender<DriverEvent>,
}

#[async_trait]
impl ConnectionDriver for FakeDriver {
    async fn initialize(&self) -> Result<(), DriverError> {
        self.world.init_calls.fetch_add(1, Ordering::SeqCst);
        if World::take_failure(&self.world.lock_failures) {
            return Err(DriverError::from_message(
                "The browser is already running for ./session",
            ));
        }
        if World::take_failure(&self.world.transient_failures) {
            return Err(DriverError::from_message(
                "Execution context was destroyed, most likely because of a navigation",
            ));
        }
        let _ = self.events.send(DriverEvent::Qr("qr-payload".into()));
        let _ = self.events.send(DriverEvent::Authenticated);
        let _ = self.events.send(DriverEvent::Ready);
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), DriverError> {
        self.world
            .sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn destroy(&self) -> Result<(), DriverError> {
        self.world.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeFactory {
    world: Arc<World>,
}

impl DriverFactory for FakeFactory {
    fn create(&self, _session_dir: &Path) -> Result<DriverHandle, DriverError> {
        self.world.created.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.world.senders.lock().unwrap().push(tx.clone());
        Ok(DriverHandle {
            driver: Arc::new(FakeDriver {
                world: self.world.clone(),
                events: tx,
            }),
            events: rx,
        })
    }
}

#[derive(Default)]
struct RecordingAlerts {
    alerts: Mutex<Vec<(AlertLevel, String)>>,
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn alert(&self, level: AlertLevel, message: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }
}

struct Harness {
    manager: Arc<ConnectionManager>,
    world: Arc<World>,
    alerts: Arc<RecordingAlerts>,
    token: CancellationToken,
    inbound: mpsc::Receiver<InboundMessage>,
    task: JoinHandle<Result<(), ConnectionError>>,
    session: PathBuf,
    _dir: TempDir,
}

fn start(world: World) -> Harness {
    start_with(world, |_| {})
}

fn start_with(world: World, tweak: impl FnOnce(&mut ManagerConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("session");
    std::fs::create_dir_all(session.join("Default")).unwrap();
    std::fs::write(session.join("Default").join("creds.json"), b"{}").unwrap();
    std::fs::write(session.join("SingletonLock"), b"").unwrap();

    let mut config = ManagerConfig {
        session_dir: session.clone(),
        init_retry: RetryPolicy::new(4, Duration::from_millis(5), Duration::from_millis(20)),
        destroy_timeout: Duration::from_millis(200),
        ..ManagerConfig::default()
    };
    tweak(&mut config);
    let world = Arc::new(world);
    let alerts = Arc::new(RecordingAlerts::default());
    let token = CancellationToken::new();
    let manager = Arc::new(ConnectionManager::new(
        config,
        Arc::new(FakeFactory {
            world: world.clone(),
        }),
        alerts.clone(),
        token.clone(),
    ));
    let (tx, inbound) = mpsc::channel(16);
    let task = tokio::spawn(manager.clone().run(tx));
    Harness {
        manager,
        world,
        alerts,
        token,
        inbound,
        task,
        session,
        _dir: dir,
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_ready(h: &Harness) {
    let manager = h.manager.clone();
    wait_until("ready", move || manager.state() == ConnectionState::Ready).await;
}

fn creds(h: &Harness) -> PathBuf {
    h.session.join("Default").join("creds.json")
}

#[tokio::test]
async fn transient_init_failures_are_retried_until_ready() {
    let h = start(World {
        transient_failures: AtomicU32::new(2),
        ..World::default()
    });

    wait_ready(&h).await;
    assert_eq!(h.world.init_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.world.created.load(Ordering::SeqCst), 1);
    // 初始化前清理残留锁文件，会话数据保留
    assert!(!h.session.join("SingletonLock").exists());
    assert!(creds(&h).exists());
}

#[tokio::test]
async fn hard_invalidation_wipes_session_and_recreates_driver() {
    let h = start(World::default());
    wait_ready(&h).await;

    h.world
        .latest()
        .send(DriverEvent::Disconnected(DisconnectReason::classify("LOGOUT")))
        .unwrap();

    let world = h.world.clone();
    wait_until("driver recreated", move || {
        world.created.load(Ordering::SeqCst) == 2 && world.init_calls.load(Ordering::SeqCst) == 2
    })
    .await;
    wait_ready(&h).await;

    assert!(!creds(&h).exists());
    assert_eq!(h.world.destroyed.load(Ordering::SeqCst), 1);
    let alerts = h.alerts.alerts.lock().unwrap();
    assert!(alerts
        .iter()
        .any(|(level, msg)| *level == AlertLevel::Warning && msg.contains("LOGOUT")));
}

#[tokio::test]
async fn failed_wipe_does_not_block_reinitialization() {
    let h = start(World::default());
    wait_ready(&h).await;

    // 会话路径被替换成普通文件，删除目录必然失败
    std::fs::remove_dir_all(&h.session).unwrap();
    std::fs::write(&h.session, b"not a directory").unwrap();

    h.world
        .latest()
        .send(DriverEvent::Disconnected(DisconnectReason::classify("LOGOUT")))
        .unwrap();

    let world = h.world.clone();
    wait_until("driver recreated", move || {
        world.created.load(Ordering::SeqCst) == 2 && world.init_calls.load(Ordering::SeqCst) == 2
    })
    .await;
    wait_ready(&h).await;

    assert!(h.session.is_file());
    assert_eq!(h.world.destroyed.load(Ordering::SeqCst), 1);
}

fn watchdog_config(policy: StalePolicy) -> impl FnOnce(&mut ManagerConfig) {
    move |config| {
        config.watchdog_interval = Duration::from_secs(60);
        config.stale_threshold = Duration::from_secs(120);
        config.watchdog_log_cap = Duration::from_secs(600);
        config.stale_policy = policy;
    }
}

#[tokio::test(start_paused = true)]
async fn stale_connection_reconnects_under_reconnect_policy() {
    let h = start_with(World::default(), watchdog_config(StalePolicy::Reconnect));
    wait_ready(&h).await;
    assert_eq!(h.world.init_calls.load(Ordering::SeqCst), 1);

    // 第三次检查（约 180s）时空闲超过阈值
    tokio::time::sleep(Duration::from_secs(200)).await;

    assert_eq!(h.world.init_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.world.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.world.destroyed.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn stale_connection_only_logs_under_log_only_policy() {
    let h = start_with(World::default(), watchdog_config(StalePolicy::LogOnly));
    wait_ready(&h).await;

    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(h.world.init_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.world.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.manager.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn soft_disconnect_reinitializes_with_existing_session() {
    let h = start(World::default());
    wait_ready(&h).await;

    h.world
        .latest()
        .send(DriverEvent::Disconnected(DisconnectReason::classify(
            "NAVIGATION",
        )))
        .unwrap();

    let world = h.world.clone();
    wait_until("re-initialized", move || {
        world.init_calls.load(Ordering::SeqCst) == 2
    })
    .await;
    wait_ready(&h).await;

    assert_eq!(h.world.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.world.destroyed.load(Ordering::SeqCst), 0);
    assert!(creds(&h).exists());
}

#[tokio::test]
async fn exhausted_init_retries_are_fatal() {
    let h = start(World {
        transient_failures: AtomicU32::new(u32::MAX),
        ..World::default()
    });

    let result = tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .unwrap()
        .unwrap();

    match result {
        Err(ConnectionError::InitExhausted { attempts, source }) => {
            assert_eq!(attempts, 5);
            assert!(source.is_navigation_race());
        }
        other => panic!("expected InitExhausted, got {:?}", other),
    }
    assert_eq!(h.world.init_calls.load(Ordering::SeqCst), 5);
    let alerts = h.alerts.alerts.lock().unwrap();
    assert!(alerts.iter().any(|(level, _)| *level == AlertLevel::Critical));
}

#[tokio::test]
async fn lock_conflict_wipes_profile_once_and_retries() {
    let h = start(World {
        lock_failures: AtomicU32::new(1),
        ..World::default()
    });

    wait_ready(&h).await;
    assert_eq!(h.world.created.load(Ordering::SeqCst), 2);
    assert_eq!(h.world.init_calls.load(Ordering::SeqCst), 2);
    assert!(!creds(&h).exists());
}

#[tokio::test]
async fn repeated_lock_conflict_is_fatal() {
    let h = start(World {
        lock_failures: AtomicU32::new(2),
        ..World::default()
    });

    let result = tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(ConnectionError::InitExhausted { attempts, source }) => {
            // 每个驱动实例各尝试一次，锁冲突不走退避重试
            assert_eq!(attempts, 2);
            assert!(source.is_profile_locked());
        }
        other => panic!("expected InitExhausted, got {:?}", other),
    }
    assert_eq!(h.world.created.load(Ordering::SeqCst), 2);
    assert_eq!(h.world.init_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn messages_are_forwarded_and_replies_sent() {
    let mut h = start(World::default());
    wait_ready(&h).await;

    let msg = InboundMessage {
        id: "wamid-1".into(),
        from: "5491122334455@c.us".into(),
        to: "5491100000000@c.us".into(),
        from_self: false,
        msg_type: "chat".into(),
        body: "#bot hola".into(),
        has_media: false,
        timestamp: 1_700_000_000,
    };
    h.world
        .latest()
        .send(DriverEvent::Message(msg.clone()))
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), h.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, msg);

    h.manager
        .send_text("5491122334455@c.us", "hola!")
        .await
        .unwrap();
    assert_eq!(h.world.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn events_from_retired_driver_are_ignored() {
    let mut h = start(World::default());
    wait_ready(&h).await;

    let retired = h.world.first();
    h.world
        .latest()
        .send(DriverEvent::Disconnected(DisconnectReason::classify("UNPAIRED")))
        .unwrap();
    let world = h.world.clone();
    wait_until("driver recreated", move || {
        world.created.load(Ordering::SeqCst) == 2
    })
    .await;
    wait_ready(&h).await;

    let stale = InboundMessage {
        id: "old".into(),
        from: "1@c.us".into(),
        to: "2@c.us".into(),
        from_self: false,
        msg_type: "chat".into(),
        body: "late".into(),
        has_media: false,
        timestamp: 0,
    };
    let _ = retired.send(DriverEvent::Message(stale));
    let got = tokio::time::timeout(Duration::from_millis(100), h.inbound.recv()).await;
    assert!(got.is_err(), "retired driver event leaked: {:?}", got);
}

#[tokio::test]
async fn shutdown_destroys_driver_and_returns_ok() {
    let h = start(World::default());
    wait_ready(&h).await;

    h.token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), h.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(h.manager.state(), ConnectionState::Destroying);
    assert_eq!(h.world.destroyed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        h.manager.send_text("x@c.us", "late").await,
        Err(DriverError::NotConnected)
    ));
}
