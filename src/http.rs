//! 健康检查与统计端点
//!
//! - `GET /health`: 进程存活
//! - `GET /ready`: 连接就绪且 LLM 熔断器未打开，否则 503
//! - `GET /stats`: 网关计数器与连接状态
//! - `GET /conversations`: 当前激活的会话（快照）

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::gateway::{Gateway, GatewayStats};
use crate::observability::mask_pii;

#[derive(Clone)]
pub struct HttpState {
    pub gateway: Arc<Gateway>,
    pub connection: Arc<ConnectionManager>,
}

#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    connection: ConnectionState,
    backend_available: bool,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    connection: ConnectionState,
    #[serde(flatten)]
    gateway: GatewayStats,
}

#[derive(Debug, Serialize)]
struct ConversationsResponse {
    count: usize,
    conversations: Vec<String>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .route("/conversations", get(conversations))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<HttpState>) -> (StatusCode, Json<Readiness>) {
    let connection = state.connection.state();
    let backend_available = state.gateway.backend_available().await;
    let ready = connection == ConnectionState::Ready && backend_available;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(Readiness {
            ready,
            connection,
            backend_available,
        }),
    )
}

async fn stats(State(state): State<HttpState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connection: state.connection.state(),
        gateway: state.gateway.stats().await,
    })
}

async fn conversations(State(state): State<HttpState>) -> Json<ConversationsResponse> {
    let conversations: Vec<String> = state
        .gateway
        .conversations()
        .list_active()
        .await
        .iter()
        .map(|c| mask_pii(c))
        .collect();
    Json(ConversationsResponse {
        count: conversations.len(),
        conversations,
    })
}

/// 监听 `bind` 直到关闭
pub async fn serve(
    bind: &str,
    state: HttpState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP endpoints listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
