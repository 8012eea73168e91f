//! Chat-completion requests with bounded retries.

use crate::config::Config;
use crate::http_client::{HttpClient, TransportError};
use crate::prompt::Prompt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    #[error("connection refused")]
    ConnectionRefused,

    /// A well-formed HTTP error status. Never retried.
    #[error("LLM endpoint returned HTTP {0}")]
    HttpStatus(u16),

    /// The reply is not the expected chat-completion JSON shape.
    #[error("malformed reply from LLM endpoint: {0}")]
    Malformed(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<RequestError>,
    },
}

impl RequestError {
    fn is_retryable(&self) -> bool {
        matches!(self, RequestError::Timeout | RequestError::ConnectionRefused)
    }
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => RequestError::Timeout,
            TransportError::ConnectionRefused => RequestError::ConnectionRefused,
            TransportError::Other(message) => RequestError::Transport(message),
        }
    }
}

/// Raw model output plus bookkeeping about how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub elapsed: Duration,
    /// Failed attempts before the successful one.
    pub retries_used: u32,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Sends the prompt to `{host}/v1/chat/completions`.
pub struct RequestClient {
    url: String,
    model: String,
    temperature: f64,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
    http: Arc<dyn HttpClient>,
}

impl RequestClient {
    pub fn new(config: &Config, http: Arc<dyn HttpClient>) -> Self {
        Self {
            url: format!("{}/v1/chat/completions", config.host),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_seconds),
            attempts: config.max_retries.max(1),
            retry_delay: Duration::from_secs_f64(config.retry_delay_seconds),
            http,
        }
    }

    fn body(&self, prompt: &Prompt) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if !prompt.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &prompt.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &prompt.user,
        });

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            stream: false,
        };
        // Serializing plain strings and numbers cannot fail.
        serde_json::to_value(request).unwrap_or_default()
    }

    /// Sends the prompt, retrying only timeouts and refused connections.
    ///
    /// At most `max_retries` attempts are made (at least one), with
    /// `retry_delay_seconds` between them.
    ///
    /// # Returns
    ///
    /// The raw reply content with the elapsed time and number of retries.
    ///
    /// # Errors
    ///
    /// * [`RequestError::Exhausted`] when every attempt timed out or was refused
    /// * [`RequestError::HttpStatus`] on any non-2xx status, without retrying
    /// * [`RequestError::Malformed`] when the body is not a chat completion or
    ///   its content is blank
    pub async fn send(&self, prompt: &Prompt) -> Result<ModelReply, RequestError> {
        let body = self.body(prompt);
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match self.attempt(&body).await {
                Ok(content) => {
                    info!("LLM replied after {} attempt(s)", attempt);
                    return Ok(ModelReply {
                        content,
                        elapsed: started.elapsed(),
                        retries_used: attempt - 1,
                    });
                }
                Err(err) if err.is_retryable() => {
                    warn!("[attempt {}/{}] {}", attempt, self.attempts, err);
                    if attempt >= self.attempts {
                        return Err(RequestError::Exhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    attempt += 1;
                    sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, body: &serde_json::Value) -> Result<String, RequestError> {
        let response = self.http.post_json(&self.url, body, self.timeout).await?;
        if !response.is_success() {
            debug!("LLM error body: {}", response.body);
            return Err(RequestError::HttpStatus(response.status));
        }
        debug!("[llm] raw response:\n{}", response.body);
        extract_content(&response.body)
    }
}

fn extract_content(body: &str) -> Result<String, RequestError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| RequestError::Malformed(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| RequestError::Malformed("no choices[0].message.content".to_string()))?;
    if content.trim().is_empty() {
        return Err(RequestError::Malformed("empty reply content".to_string()));
    }
    Ok(content)
}
