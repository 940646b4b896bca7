use crate::config::ProviderConfig;
use crate::error::RagError;
use crate::models::{ConversationTurn, Role};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use url::Url;

const OPENAI_PROVIDER: &str = "openai-chat";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for ChatMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: match turn.role {
                Role::User => MessageRole::User,
                Role::Assistant => MessageRole::Assistant,
            },
            content: turn.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RagError>;
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for Arc<T> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RagError> {
        (**self).complete(request).await
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Chat client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatModel {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(config: &ProviderConfig) -> Result<Self, RagError> {
        let model = Self {
            client: config.http_client()?,
            endpoint: config.endpoint("chat/completions")?,
            api_key: config.api_key()?.to_string(),
            model: config.chat_model.clone(),
        };
        info!(model = %model.model, endpoint = %model.endpoint, "chat model ready");
        Ok(model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RagError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: &request.messages,
                temperature: request.temperature,
                stream: false,
            })
            .send()
            .await
            .map_err(|error| RagError::provider(OPENAI_PROVIDER, error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::provider(
                OPENAI_PROVIDER,
                format!("{status}: {body}"),
            ));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|error| RagError::provider(OPENAI_PROVIDER, error.to_string()))?;

        let text = payload
            .choices
            .into_iter()
            .filter_map(|choice| choice.message.content)
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(RagError::provider(OPENAI_PROVIDER, "empty completion"));
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_map_to_chat_roles() {
        let user = ChatMessage::from(&ConversationTurn::user("Q1"));
        let assistant = ChatMessage::from(&ConversationTurn::assistant("A1"));
        assert_eq!(user.role, MessageRole::User);
        assert_eq!(assistant.role, MessageRole::Assistant);
        assert_eq!(assistant.content, "A1");
    }

    #[test]
    fn messages_serialize_with_lowercase_roles() -> Result<(), serde_json::Error> {
        let json = serde_json::to_value(ChatMessage::system("be brief"))?;
        assert_eq!(json["role"], "system");
        Ok(())
    }

    #[test]
    fn chat_model_requires_a_key() {
        assert!(matches!(
            OpenAiChatModel::new(&ProviderConfig::default()),
            Err(RagError::Configuration(_))
        ));
    }
}
