//! Reasoning backend client (OpenAI-compatible chat completions).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::BackendError;

/// One turn of conversation context handed to the reasoning backend.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Produce the assistant's next reply given the system prompt and the
    /// conversation so far.
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<String, BackendError>;
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Streaming chat-completions client. The response is consumed as SSE
/// and accumulated; sessions deal in whole utterances.
pub struct OpenAiReasoning {
    client: reqwest::Client,
    api_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiReasoning {
    pub fn new(
        api_url: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            model: model.into(),
            max_tokens,
            temperature,
            timeout,
        })
    }

    async fn stream_completion(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<String, BackendError> {
        let mut messages = vec![ChatTurn::system(system_prompt)];
        messages.extend_from_slice(history);

        let payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let response = self
            .client
            .post(&self.api_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("reasoning request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Failed(format!(
                "reasoning returned {status}: {body}"
            )));
        }

        let mut full = String::new();
        let mut carry = String::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| BackendError::Failed(format!("reasoning stream: {e}")))?;
            carry.push_str(&String::from_utf8_lossy(&chunk));

            // SSE framing: complete lines only, the remainder carries over.
            while let Some(newline) = carry.find('\n') {
                let line = carry[..newline].trim().to_string();
                carry.drain(..=newline);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(full);
                }
                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(parsed) => {
                        if let Some(delta) = parsed
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_deref())
                        {
                            full.push_str(delta);
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping unparseable SSE chunk"),
                }
            }
        }

        Ok(full)
    }
}

#[async_trait]
impl ReasoningClient for OpenAiReasoning {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<String, BackendError> {
        match tokio::time::timeout(self.timeout, self.stream_completion(system_prompt, history))
            .await
        {
            Err(_) => Err(BackendError::Timeout(format!(
                "reasoning exceeded {:?}",
                self.timeout
            ))),
            Ok(result) => result,
        }
    }
}
