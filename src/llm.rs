//! Language model integration over an Ollama-compatible chat API

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Response from a completed generation
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub tokens_used: Option<u32>,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Stream of answer fragments; closes on completion or error
pub type TokenStream = Pin<Box<dyn futures::Stream<Item = Result<String>> + Send>>;

/// Trait for language model operations
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Produce a full chat completion
    async fn complete(&self, messages: &[ChatMessage]) -> Result<CompletionResponse>;

    /// Produce a token stream for a chat completion
    async fn complete_stream(&self, messages: &[ChatMessage]) -> Result<TokenStream>;

    /// Cheap liveness probe for health reporting
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// HTTP client against an Ollama-compatible `/api/chat` endpoint
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    message: ChatMessage,
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamFrame {
    #[serde(default)]
    message: Option<ChatMessage>,
    done: bool,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.config.chat_model.clone(),
            messages: messages.to_vec(),
            stream,
            options: ChatOptions {
                num_predict: self.config.max_tokens,
                temperature: self.config.temperature,
            },
        }
    }
}

/// Map a non-success chat response to a typed LLM error
async fn error_from_response(response: reqwest::Response) -> LlmError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    match status.as_u16() {
        429 => LlmError::RateLimited { retry_after },
        503 => LlmError::NoCapacity,
        400 if body.to_lowercase().contains("context") => LlmError::ContextTooLong,
        _ if body.to_lowercase().contains("refus") => LlmError::PolicyRefusal(body),
        _ => LlmError::Transient(format!("{status}: {body}")),
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<CompletionResponse> {
        debug!("Requesting completion for {} messages", messages.len());

        let url = self.api_url("chat");
        let request = self.request(messages, false);

        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
        .map_err(|e| LlmError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let err = error_from_response(response).await;
            error!("Chat API error: {}", err);
            return Err(err.into());
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if !chat.done {
            return Err(LlmError::InvalidResponse("incomplete response".to_string()).into());
        }

        info!("Generated {} tokens", chat.eval_count.unwrap_or(0));

        Ok(CompletionResponse {
            text: chat.message.content,
            tokens_used: chat.eval_count,
            model: chat.model,
            finish_reason: chat.done_reason,
        })
    }

    async fn complete_stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        debug!("Opening completion stream for {} messages", messages.len());

        let url = self.api_url("chat");
        let request = self.request(messages, true);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let err = error_from_response(response).await;
            error!("Chat stream API error: {}", err);
            return Err(err.into());
        }

        // The endpoint emits one JSON object per line; frames carry message
        // deltas until a final frame with done=true.
        let byte_stream = response.bytes_stream();
        let stream: BoxStream<'static, Result<String>> = byte_stream
            .map(|chunk| {
                chunk.map_err(|e| crate::error::AssistantError::from(LlmError::Transient(e.to_string())))
            })
            .scan(String::new(), |buffer, chunk| {
                let out: Vec<Result<String>> = match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        let mut tokens = Vec::new();
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<ChatStreamFrame>(line) {
                                Ok(frame) => {
                                    if let Some(message) = frame.message {
                                        if !message.content.is_empty() {
                                            tokens.push(Ok(message.content));
                                        }
                                    }
                                    if frame.done {
                                        break;
                                    }
                                }
                                Err(e) => tokens.push(Err(LlmError::InvalidResponse(
                                    e.to_string(),
                                )
                                .into())),
                            }
                        }
                        tokens
                    }
                    Err(e) => vec![Err(e)],
                };
                futures::future::ready(Some(futures::stream::iter(out)))
            })
            .flatten()
            .boxed();

        Ok(stream)
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .get(self.config.base_url.trim_end_matches('/'))
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;
        Ok(())
    }
}

/// Helper function to create a system message
pub fn system_message(content: impl Into<String>) -> ChatMessage {
    ChatMessage {
        role: Role::System,
        content: content.into(),
    }
}

/// Helper function to create a user message
pub fn user_message(content: impl Into<String>) -> ChatMessage {
    ChatMessage {
        role: Role::User,
        content: content.into(),
    }
}

/// Helper function to create an assistant message
pub fn assistant_message(content: impl Into<String>) -> ChatMessage {
    ChatMessage {
        role: Role::Assistant,
        content: content.into(),
    }
}
