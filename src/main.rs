//! Relay 网关服务
//!
//! 配置: config/default.toml，可用 `RELAY__*` 环境变量覆盖；第一个命令行参数可指定额外的配置文件。
//!
//! 环境变量:
//! - OPENAI_API_KEY: 设置后使用 OpenAI 兼容后端，否则使用 Echo 后端
//! - RELAY_CONSOLE_SENDER: 控制台驱动的发送方标识（默认 "console@c.us"）
//! - RUST_LOG: 日志过滤
//!
//! 启动: cargo run -- [config.toml]；带 HTTP 端点: cargo run --features http

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use relay::backend::{ConversationBackend, EchoBackend, GuardedBackend, OpenAiBackend};
use relay::config::{load_config, AppConfig};
use relay::connection::{ConnectionManager, ConsoleDriverFactory, LogAlertSink};
use relay::core::shutdown::StatsReport;
use relay::core::{RelayError, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use relay::gateway::{AllowList, ConversationStore, Deduplicator, Gateway, RateLimiter};
use relay::observability;
use relay::resilience::CircuitBreaker;
use relay::storage::TempCleaner;
use tokio::sync::mpsc;

/// 入站消息缓冲
const INBOUND_BUFFER: usize = 256;

fn build_backend(config: &AppConfig, breaker: Arc<CircuitBreaker>) -> Arc<dyn ConversationBackend> {
    match OpenAiBackend::from_env(&config.llm) {
        Some(openai) => {
            tracing::info!("Using OpenAI-compatible backend (model {})", config.llm.model);
            Arc::new(GuardedBackend::new(openai, breaker))
        }
        None => {
            tracing::warn!("OPENAI_API_KEY not set, falling back to echo backend");
            Arc::new(GuardedBackend::new(EchoBackend, breaker))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("failed to load configuration")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let allow_list = AllowList::new(&config.gateway.allowed_senders);
    if allow_list.is_open() {
        tracing::warn!("No allowed senders configured, every sender is authorized");
    } else {
        tracing::info!("{} allowed sender(s)", allow_list.len());
    }

    let sender = std::env::var("RELAY_CONSOLE_SENDER").unwrap_or_else(|_| "console@c.us".into());
    let factory = Arc::new(ConsoleDriverFactory::new(sender, "relay@c.us"));
    let connection = Arc::new(ConnectionManager::new(
        config.connection.manager(),
        factory,
        Arc::new(LogAlertSink),
        shutdown.token(),
    ));

    let llm_breaker = Arc::new(CircuitBreaker::new("llm", config.breaker.breaker()));
    let backend = build_backend(&config, llm_breaker.clone());

    let dedup = Arc::new(Deduplicator::new(config.dedup.dedup()));
    let limiter = Arc::new(RateLimiter::new(config.limits.rate_limit()));
    let conversations = Arc::new(ConversationStore::new(config.limits.conversation_ttl()));
    let gateway = Arc::new(
        Gateway::new(
            config.gateway.settings(),
            allow_list,
            dedup,
            limiter.clone(),
            conversations,
            backend,
            connection.clone(),
        )
        .with_backend_breaker(llm_breaker),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let gateway_task = tokio::spawn(gateway.clone().run(inbound_rx));

    let cleaner = Arc::new(TempCleaner::from_config(&config.storage));
    let cleaner_task = tokio::spawn(cleaner.run(shutdown.token()));

    // 定期清理长时间无活动的限流记录
    let sweep_token = shutdown.token();
    let sweep_interval = std::time::Duration::from_secs(config.limits.rate_limit_entry_ttl_secs.max(60));
    let sweep_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = sweep_token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = limiter.sweep_idle().await;
                    if removed > 0 {
                        tracing::debug!("Dropped {} idle rate bucket(s)", removed);
                    }
                }
            }
        }
    });

    #[cfg(feature = "http")]
    let http_task = {
        let state = relay::http::HttpState {
            gateway: gateway.clone(),
            connection: connection.clone(),
        };
        let bind = config.http.bind.clone();
        let token = shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = relay::http::serve(&bind, state, token).await {
                tracing::error!("HTTP server failed: {}", e);
            }
        })
    };

    tracing::info!(
        "Relay started (prefix {:?}, session dir {})",
        config.gateway.bot_prefix,
        config.connection.session_dir.display()
    );

    let outcome = connection.run(inbound_tx).await.map_err(RelayError::from);
    match &outcome {
        Ok(()) => tracing::info!("Connection manager finished"),
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
        }
    }
    if !shutdown.is_shutdown() {
        shutdown.shutdown(ShutdownReason::UserInitiated);
    }

    // connection.run 返回后入站发送端已释放，网关任务随之结束
    let _ = gateway_task.await;
    let _ = cleaner_task.await;
    let _ = sweep_task.await;
    #[cfg(feature = "http")]
    let _ = http_task.await;

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(StatsReport::new(gateway));
    coordinator.run_cleanup().await;

    outcome.context("relay stopped with a fatal error")
}
