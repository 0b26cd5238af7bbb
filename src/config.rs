//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__LIMITS__RATE_LIMIT_PER_MINUTE=20`）。
//! `RELAY__GATEWAY__ALLOWED_SENDERS` 按逗号分隔解析为列表。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::{ManagerConfig, StalePolicy};
use crate::gateway::{DedupConfig, GatewaySettings, RateLimitConfig};
use crate::resilience::{BreakerConfig, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewaySection,
    pub limits: LimitsSection,
    pub dedup: DedupSection,
    pub breaker: BreakerSection,
    pub connection: ConnectionSection,
    pub storage: StorageSection,
    pub llm: LlmSection,
    pub http: HttpSection,
}

/// [gateway] 段：激活前缀、白名单、回复文案
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySection {
    pub bot_prefix: String,
    /// 允许的发送方；为空表示不限制
    pub allowed_senders: Vec<String>,
    pub max_text_chars: usize,
    /// 后端失败时的致歉文案，不配置则静默
    pub error_reply: Option<String>,
    pub too_long_reply: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let settings = GatewaySettings::default();
        Self {
            bot_prefix: settings.bot_prefix,
            allowed_senders: Vec::new(),
            max_text_chars: settings.max_text_chars,
            error_reply: settings.error_reply,
            too_long_reply: settings.too_long_reply,
        }
    }
}

impl GatewaySection {
    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings {
            bot_prefix: self.bot_prefix.clone(),
            max_text_chars: self.max_text_chars,
            error_reply: self.error_reply.clone().filter(|r| !r.trim().is_empty()),
            too_long_reply: self.too_long_reply.clone(),
        }
    }
}

/// [limits] 段：限流与会话存活
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsSection {
    pub rate_limit_per_minute: usize,
    pub rate_limit_window_secs: u64,
    pub rate_limit_entry_ttl_secs: u64,
    pub conversation_ttl_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 10,
            rate_limit_window_secs: 60,
            rate_limit_entry_ttl_secs: 15 * 60,
            conversation_ttl_secs: 6 * 60 * 60,
        }
    }
}

impl LimitsSection {
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_per_window: self.rate_limit_per_minute,
            window: Duration::from_secs(self.rate_limit_window_secs),
            entry_ttl: Duration::from_secs(self.rate_limit_entry_ttl_secs),
        }
    }

    pub fn conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.conversation_ttl_secs)
    }
}

/// [dedup] 段：已处理消息与自发消息缓存容量
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DedupSection {
    pub processed_messages_limit: usize,
    pub processed_messages_cleanup_size: usize,
    pub bot_messages_cache_limit: usize,
    pub bot_messages_cleanup_size: usize,
    pub bot_message_ttl_secs: u64,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            processed_messages_limit: 1000,
            processed_messages_cleanup_size: 200,
            bot_messages_cache_limit: 2000,
            bot_messages_cleanup_size: 1000,
            bot_message_ttl_secs: 60,
        }
    }
}

impl DedupSection {
    pub fn dedup(&self) -> DedupConfig {
        DedupConfig {
            processed_limit: self.processed_messages_limit,
            processed_cleanup_size: self.processed_messages_cleanup_size,
            echo_cache_limit: self.bot_messages_cache_limit,
            echo_cleanup_size: self.bot_messages_cleanup_size,
            echo_ttl: Duration::from_secs(self.bot_message_ttl_secs),
        }
    }
}

/// [breaker] 段：LLM 调用的熔断与重试
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: usize,
    pub failure_window_secs: u64,
    pub cooldown_secs: u64,
    pub half_open_max_requests: u32,
    /// 单次调用超时（毫秒），0 表示不设超时
    pub call_timeout_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cooldown_secs: 60,
            half_open_max_requests: 3,
            call_timeout_ms: 30_000,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl BreakerSection {
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            half_open_max_requests: self.half_open_max_requests,
            call_timeout: (self.call_timeout_ms > 0)
                .then(|| Duration::from_millis(self.call_timeout_ms)),
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            ),
        }
    }
}

/// [connection] 段：会话目录、初始化重试、看门狗
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub session_dir: PathBuf,
    /// 初始化总尝试次数（含首次）
    pub init_max_attempts: u32,
    pub init_base_delay_ms: u64,
    pub init_max_delay_ms: u64,
    pub watchdog_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub watchdog_log_cap_secs: u64,
    pub stale_policy: StalePolicy,
    pub qr_min_interval_secs: u64,
    pub destroy_timeout_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from("./session"),
            init_max_attempts: 5,
            init_base_delay_ms: 1_000,
            init_max_delay_ms: 15_000,
            watchdog_interval_secs: 5 * 60,
            stale_threshold_secs: 30 * 60,
            watchdog_log_cap_secs: 60 * 60,
            stale_policy: StalePolicy::LogOnly,
            qr_min_interval_secs: 30,
            destroy_timeout_secs: 10,
        }
    }
}

impl ConnectionSection {
    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            session_dir: self.session_dir.clone(),
            init_retry: RetryPolicy::new(
                self.init_max_attempts.saturating_sub(1),
                Duration::from_millis(self.init_base_delay_ms),
                Duration::from_millis(self.init_max_delay_ms),
            ),
            // interval 周期不能为 0
            watchdog_interval: Duration::from_secs(self.watchdog_interval_secs.max(1)),
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            watchdog_log_cap: Duration::from_secs(self.watchdog_log_cap_secs),
            stale_policy: self.stale_policy,
            qr_min_interval: Duration::from_secs(self.qr_min_interval_secs),
            destroy_timeout: Duration::from_secs(self.destroy_timeout_secs),
        }
    }
}

/// [storage] 段：临时文件清理
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSection {
    pub temp_dir: PathBuf,
    pub temp_max_age_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("./temp"),
            temp_max_age_secs: 6 * 60 * 60,
            cleanup_interval_secs: 30 * 60,
        }
    }
}

/// [llm] 段：模型、端点与提示词
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    pub system_prompt: String,
    /// 每个会话保留的历史消息条数
    pub history_len: usize,
    /// 结束会话时的告别语
    pub farewell: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            system_prompt: "Eres un asistente útil. Responde siempre en el mismo idioma en que \
                            el usuario hace la consulta."
                .to_string(),
            history_len: 20,
            farewell: "Conversación desactivada. Usa \"#bot\" para reactivar.".to_string(),
        }
    }
}

/// [http] 段：健康检查与统计端点
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpSection {
    pub bind: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("gateway.allowed_senders")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
