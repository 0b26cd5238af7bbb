//! 回显后端（无需 API）
//!
//! 原样回显文本；文本带退出关键词时告别并结束会话，便于本地跑通整条链路。

use async_trait::async_trait;

use super::{BackendError, BackendReply, BackendRequest, ConversationBackend};

#[derive(Debug, Default)]
pub struct EchoBackend;

#[async_trait]
impl ConversationBackend for EchoBackend {
    async fn process(&self, request: &BackendRequest) -> Result<BackendReply, BackendError> {
        if request.deactivation_hint {
            return Ok(BackendReply::text("Conversación finalizada. ¡Hasta luego!").deactivate());
        }
        if !request.kind.is_text() {
            return Ok(BackendReply::text(format!(
                "Echo: recibido contenido {:?}",
                request.kind
            )));
        }
        Ok(BackendReply::text(format!("Echo: {}", request.text)))
    }

    fn name(&self) -> &str {
        "echo"
    }
}
