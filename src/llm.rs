//! Chat-completion providers.
//!
//! Implements [`ChatModel`] for OpenAI, Azure OpenAI and Ollama (all via an
//! OpenAI-compatible `chat/completions` request), plus [`DisabledChatModel`].
//! Transport, rate-limit and malformed-response failures are all reported
//! as [`Error::ProviderUnavailable`].

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kbchat_core::llm::{ChatModel, CompletionRequest};
use kbchat_core::{Error, Provider, Result, Sender};

use crate::config::LlmConfig;
use crate::http::{self, Auth};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

fn unavailable(err: impl std::fmt::Display) -> Error {
    Error::provider(Provider::Language, err.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequestMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatRequestMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Flatten a completion request into role-tagged messages:
/// system, then the history in order, then the new input.
pub fn build_messages(request: &CompletionRequest) -> Vec<ChatRequestMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    messages.push(ChatRequestMessage {
        role: "system".to_string(),
        content: request.system.clone(),
    });
    for turn in &request.history {
        let role = match turn.sender {
            Sender::User => "user",
            Sender::Bot => "assistant",
        };
        messages.push(ChatRequestMessage {
            role: role.to_string(),
            content: turn.text.clone(),
        });
    }
    messages.push(ChatRequestMessage {
        role: "user".to_string(),
        content: request.input.clone(),
    });
    messages
}

fn parse_chat_response(json: serde_json::Value) -> anyhow::Result<String> {
    let response: ChatResponse = serde_json::from_value(json)
        .map_err(|e| anyhow::anyhow!("Invalid chat response: {}", e))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("Empty response from language model"))
}

// ============ Disabled ============

pub struct DisabledChatModel;

#[async_trait]
impl ChatModel for DisabledChatModel {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        Err(unavailable("language model provider is disabled"))
    }
}

// ============ OpenAI-compatible ============

/// Chat model speaking the OpenAI `chat/completions` protocol.
///
/// | Provider | Endpoint | Auth |
/// |----------|----------|------|
/// | `openai` | `{url or api.openai.com/v1}/chat/completions` | Bearer |
/// | `azure` | `{url}/openai/deployments/{deployment}/chat/completions` | `api-key` |
/// | `ollama` | `{url}/v1/chat/completions` | none |
pub struct OpenAIChatModel {
    client: reqwest::Client,
    endpoint: String,
    auth: Auth,
    label: &'static str,
    model: String,
    /// Azure selects the model by deployment and rejects a `model` field.
    send_model: bool,
    temperature: f32,
    max_tokens: Option<u32>,
    max_retries: u32,
}

impl OpenAIChatModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let (endpoint, auth, label, model, send_model) = match config.provider.as_str() {
            "openai" => {
                let base = config.url.as_deref().unwrap_or(OPENAI_API_URL);
                (
                    format!("{}/chat/completions", base.trim_end_matches('/')),
                    Auth::Bearer(http::secret_from_env(&config.api_key_env)?),
                    "OpenAI",
                    required_model(config)?,
                    true,
                )
            }
            "azure" => {
                let base = config
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("llm.url required for Azure provider"))?;
                let deployment = config
                    .deployment
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("llm.deployment required for Azure provider"))?;
                (
                    format!(
                        "{}/openai/deployments/{}/chat/completions?api-version={}",
                        base.trim_end_matches('/'),
                        deployment,
                        config.api_version
                    ),
                    Auth::ApiKey(http::secret_from_env(&config.api_key_env)?),
                    "Azure OpenAI",
                    config.model.clone().unwrap_or(deployment),
                    false,
                )
            }
            "ollama" => {
                let base = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
                (
                    format!("{}/v1/chat/completions", base.trim_end_matches('/')),
                    Auth::None,
                    "Ollama",
                    required_model(config)?,
                    true,
                )
            }
            other => bail!("Unknown llm provider: {}", other),
        };

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            endpoint,
            auth,
            label,
            model,
            send_model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }
}

fn required_model(config: &LlmConfig) -> anyhow::Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("llm.model required for {} provider", config.provider))
}

#[async_trait]
impl ChatModel for OpenAIChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequest {
            model: self.send_model.then_some(self.model.as_str()),
            messages: build_messages(request),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let body = serde_json::to_value(&body).map_err(unavailable)?;

        let json = http::post_json(
            &self.client,
            &self.endpoint,
            &self.auth,
            &body,
            self.max_retries,
            self.label,
        )
        .await
        .map_err(unavailable)?;

        parse_chat_response(json).map_err(unavailable)
    }
}

/// Create the configured [`ChatModel`].
pub fn create_chat_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChatModel)),
        "openai" | "azure" | "ollama" => Ok(Arc::new(OpenAIChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbchat_core::Turn;

    #[test]
    fn test_build_messages_order_and_roles() {
        let request = CompletionRequest::new(
            "be brief",
            vec![Turn::bot("Hello"), Turn::user("Tell me about alpha")],
            "And beta?",
        );
        let messages = build_messages(&request);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "assistant", "user", "user"]);
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[3].content, "And beta?");
    }

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Alpha is first."}}]
        });
        assert_eq!(parse_chat_response(json).unwrap(), "Alpha is first.");
    }

    #[test]
    fn test_parse_chat_response_rejects_empty() {
        assert!(parse_chat_response(serde_json::json!({"choices": []})).is_err());
        let blank = serde_json::json!({"choices": [{"message": {"content": "  "}}]});
        assert!(parse_chat_response(blank).is_err());
        assert!(parse_chat_response(serde_json::json!({"error": "bad"})).is_err());
    }

    #[test]
    fn test_azure_request_omits_model() {
        let body = ChatRequest {
            model: None,
            messages: vec![],
            temperature: 0.0,
            max_tokens: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("model").is_none());
        assert!(json.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn test_disabled_model_is_unavailable() {
        let model = create_chat_model(&LlmConfig::default()).unwrap();
        let err = model
            .complete(&CompletionRequest::new("s", vec![], "q"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provider_unavailable");
    }
}
