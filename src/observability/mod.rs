//! 可观测性：日志初始化与脱敏

use std::sync::OnceLock;

use regex::Regex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

static PHONE_RE: OnceLock<Regex> = OnceLock::new();

/// 把疑似电话号码（6 位以上数字）替换为 `***` 加末 4 位，用于日志中的发送方与会话 ID
pub fn mask_pii(text: &str) -> String {
    let re = PHONE_RE.get_or_init(|| Regex::new(r"\+?[0-9]{6,}").unwrap());
    re.replace_all(text, |caps: &regex::Captures| {
        let digits = &caps[0];
        format!("***{}", &digits[digits.len() - 4..])
    })
    .into_owned()
}
