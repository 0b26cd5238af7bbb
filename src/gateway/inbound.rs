//! 入站消息的授权、分类与前缀/退出关键词识别

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::connection::InboundMessage;

/// 内容分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Audio,
    Image,
    /// 带文字说明的媒体
    Mixed,
    Text,
}

impl ContentKind {
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text)
    }
}

/// 规范化发送方标识：取 `@` 之前的部分，去掉所有非字母数字字符
pub fn normalize_sender(raw: &str) -> String {
    let local = raw.split('@').next().unwrap_or(raw);
    local.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// 发送方白名单；为空时放行所有人
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| normalize_sender(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn allows(&self, sender: &str) -> bool {
        self.is_open() || self.entries.contains(&normalize_sender(sender))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 按驱动给出的类型与媒体标记分类；不支持的类型或空文本返回 None
pub fn classify(msg: &InboundMessage) -> Option<ContentKind> {
    let has_text = !msg.body.trim().is_empty();
    match msg.msg_type.as_str() {
        "audio" | "ptt" if msg.has_media => Some(ContentKind::Audio),
        "image" if msg.has_media && has_text => Some(ContentKind::Mixed),
        "image" if msg.has_media => Some(ContentKind::Image),
        "chat" if has_text => Some(ContentKind::Text),
        _ => None,
    }
}

/// 去掉激活前缀；没有前缀返回 None，前缀后无内容返回空串
pub fn strip_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    text.trim().strip_prefix(prefix).map(str::trim)
}

fn deactivation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(desactivar|desactiva|detener|terminar|salir|stop|exit|chau)\b(\s+(la\s+|el\s+)?(conversaci[oó]n|bot|chat))?",
        )
        .unwrap()
    })
}

/// 文本是否带退出关键词
pub fn is_deactivation_request(text: &str) -> bool {
    deactivation_regex().is_match(text)
}
