//! OpenAI 兼容后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。每个会话保留最近 `history_len` 条消息，
//! 请求时拼上系统提示词与当前时间。

use std::collections::{HashMap, VecDeque};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BackendError, BackendReply, BackendRequest, ConversationBackend};
use crate::config::LlmSection;
use crate::gateway::ContentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
struct Turn {
    role: Role,
    content: String,
}

pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    model: String,
    system_prompt: String,
    history_len: usize,
    farewell: String,
    histories: RwLock<HashMap<String, VecDeque<Turn>>>,
}

impl OpenAiBackend {
    pub fn new(config: &LlmSection, api_key: &str) -> Self {
        let openai = match config.base_url.as_deref() {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            client: Client::with_config(openai),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            history_len: config.history_len,
            farewell: config.farewell.clone(),
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// 从环境变量 OPENAI_API_KEY 读取 Key；未设置时返回 None
    pub fn from_env(config: &LlmSection) -> Option<Self> {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|key| Self::new(config, &key))
    }

    pub async fn history_len(&self, conversation_id: &str) -> usize {
        self.histories
            .read()
            .await
            .get(conversation_id)
            .map_or(0, VecDeque::len)
    }

    fn system_message(&self, request: &BackendRequest) -> String {
        let now = chrono::DateTime::from_timestamp(request.timestamp_sec, 0)
            .unwrap_or_else(chrono::Utc::now)
            .format("%Y-%m-%d %H:%M:%S UTC");
        format!(
            "{}\n\nFecha y hora actual: {}\nUsuario: {}",
            self.system_prompt, now, request.sender_id
        )
    }

    fn build_messages(
        &self,
        request: &BackendRequest,
        history: &[Turn],
        user_text: &str,
    ) -> Result<Vec<ChatCompletionRequestMessage>, BackendError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_message(request))
                .build()
                .map_err(|e| BackendError::Fatal(e.to_string()))?,
        ));
        for turn in history {
            let message = match turn.role {
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(turn.content.clone())
                        .build()
                        .map_err(|e| BackendError::Fatal(e.to_string()))?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(turn.content.clone())
                        .build()
                        .map_err(|e| BackendError::Fatal(e.to_string()))?,
                ),
            };
            messages.push(message);
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_text.to_string())
                .build()
                .map_err(|e| BackendError::Fatal(e.to_string()))?,
        ));
        Ok(messages)
    }

    async fn remember(&self, conversation_id: &str, user_text: &str, reply: &str) {
        let mut histories = self.histories.write().await;
        let history = histories.entry(conversation_id.to_string()).or_default();
        history.push_back(Turn {
            role: Role::User,
            content: user_text.to_string(),
        });
        history.push_back(Turn {
            role: Role::Assistant,
            content: reply.to_string(),
        });
        while history.len() > self.history_len {
            history.pop_front();
        }
    }
}

/// 非文本内容没有转写时用占位说明
fn user_text(request: &BackendRequest) -> String {
    let caption = request.text.trim();
    match request.kind {
        ContentKind::Text => caption.to_string(),
        ContentKind::Audio => "[El usuario envió un audio]".to_string(),
        ContentKind::Image if caption.is_empty() => "[El usuario envió una imagen]".to_string(),
        ContentKind::Image | ContentKind::Mixed => {
            format!("[El usuario envió una imagen] {}", caption)
        }
    }
}

#[async_trait]
impl ConversationBackend for OpenAiBackend {
    async fn process(&self, request: &BackendRequest) -> Result<BackendReply, BackendError> {
        if request.deactivation_hint {
            self.histories.write().await.remove(&request.conversation_id);
            return Ok(BackendReply::text(self.farewell.clone()).deactivate());
        }

        let text = user_text(request);
        let history: Vec<Turn> = self
            .histories
            .read()
            .await
            .get(&request.conversation_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();

        let req = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.build_messages(request, &history, &text)?)
            .build()
            .map_err(|e| BackendError::Fatal(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(req)
            .await
            .map_err(|e| BackendError::classify(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            tracing::warn!("{} returned an empty completion", self.model);
            return Ok(BackendReply::silent());
        }

        self.remember(&request.conversation_id, &text, &content).await;
        Ok(BackendReply::text(content))
    }

    fn name(&self) -> &str {
        "openai"
    }
}
