//! OpenAI-compatible chat completions client with automatic retry for transient errors.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use super::CompletionClient;
use crate::config::CompletionConfig;
use crate::util::truncate_str;

/// Per-request timeout used until `with_request_timeout` overrides it.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Chat completions client (Cerebras by default) with retry on 429/5xx/network errors.
pub struct ChatCompletionsClient {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    request_timeout: Duration,
    retry_config: RetryConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
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

fn http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to build HTTP client with timeout, using defaults");
        Client::new()
    })
}

impl ChatCompletionsClient {
    pub fn new(api_url: String, api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT),
            api_url,
            api_key,
            model,
            max_tokens,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_config: RetryConfig::default(),
        }
    }

    /// Build a client from configuration, `None` when no API key is set.
    pub fn from_config(config: &CompletionConfig) -> Option<Self> {
        if !config.is_enabled() {
            return None;
        }
        let api_key = config.api_key.clone()?;
        Some(Self::new(
            config.api_url.clone(),
            api_key,
            config.model.clone(),
            config.max_tokens,
        )
        .with_request_timeout(config.request_timeout))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request<'a>(&'a self, system: &'a str, prompt: &'a str) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });
        ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
        }
    }

    /// Parse Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn create_error(status: u16, body: &str, retry_after: Option<Duration>) -> LlmError {
        let body = truncate_str(body, 1000).to_string();
        match classify_http_status(status) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body, retry_after),
            LlmErrorKind::ClientError => LlmError::client_error(status, body),
            _ => LlmError::server_error(status, body),
        }
    }

    fn extract_content(body: &str) -> Result<String, LlmError> {
        let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
            LlmError::parse_error(format!(
                "Failed to parse response: {}, body: {}",
                e,
                truncate_str(body, 500)
            ))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LlmError::empty_completion("No content in first choice".to_string()))
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network_error(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    LlmError::network_error(format!("Connection failed: {}", e))
                } else {
                    LlmError::network_error(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status.as_u16(), &body, retry_after));
        }

        Self::extract_content(&body)
    }

    /// Execute a request with automatic retry for transient errors.
    async fn execute_with_retry(&self, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            let error = match self.execute_request(request).await {
                Ok(content) => {
                    if attempt > 0 {
                        tracing::info!(
                            attempt,
                            elapsed = ?start.elapsed(),
                            "Completion succeeded after retries"
                        );
                    }
                    return Ok(content);
                }
                Err(error) => error,
            };

            if !self.retry_config.should_retry(&error) || attempt >= self.retry_config.max_retries {
                tracing::error!(attempt, error = %error, "Completion request failed");
                return Err(error);
            }

            let remaining = self
                .retry_config
                .max_retry_duration
                .saturating_sub(start.elapsed());
            let delay = error.suggested_delay(attempt).min(remaining);
            if delay.is_zero() {
                tracing::warn!(attempt, error = %error, "No retry time remaining");
                return Err(error);
            }

            tracing::warn!(
                attempt = attempt + 1,
                kind = %error.kind,
                delay = ?delay,
                "Completion attempt failed, retrying: {}",
                error.message
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl CompletionClient for ChatCompletionsClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let request = self.build_request(system, prompt);
        tracing::debug!(model = %self.model, prompt_len = prompt.len(), "Requesting completion");
        self.execute_with_retry(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> ChatCompletionsClient {
        ChatCompletionsClient::new(
            "http://localhost/v1/chat/completions".to_string(),
            "key".to_string(),
            "llama-3.3-70b".to_string(),
            1000,
        )
    }

    #[test]
    fn request_has_system_then_user_message() {
        let client = client();
        let request = client.build_request("be brief", "hello");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "model": "llama-3.3-70b",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello"}
                ],
                "max_tokens": 1000
            })
        );
    }

    #[test]
    fn empty_system_prompt_is_omitted() {
        let client = client();
        let request = client.build_request("", "hello");
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn extracts_first_choice_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"print(1)"}}]}"#;
        assert_eq!(ChatCompletionsClient::extract_content(body).unwrap(), "print(1)");
    }

    #[test]
    fn missing_content_is_an_empty_completion() {
        let err = ChatCompletionsClient::extract_content(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::EmptyCompletion);
        let err = ChatCompletionsClient::extract_content("not json").unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::ParseError);
    }

    #[test]
    fn status_maps_to_error_kind() {
        let err = ChatCompletionsClient::create_error(429, "slow", Some(Duration::from_secs(3)));
        assert_eq!(err.kind, LlmErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(
            ChatCompletionsClient::create_error(401, "", None).kind,
            LlmErrorKind::ClientError
        );
        assert_eq!(
            ChatCompletionsClient::create_error(502, "", None).kind,
            LlmErrorKind::ServerError
        );
    }

    #[test]
    fn from_config_requires_key() {
        assert!(ChatCompletionsClient::from_config(&CompletionConfig::default()).is_none());
        let config = CompletionConfig {
            api_key: Some("secret".to_string()),
            ..CompletionConfig::default()
        };
        let client = ChatCompletionsClient::from_config(&config).unwrap();
        assert_eq!(client.model(), "llama-3.3-70b");
        assert_eq!(client.request_timeout(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn stalled_endpoint_times_out() {
        // Accepted by the kernel backlog but never answered.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = ChatCompletionsClient::new(
            format!("http://{}/v1/chat/completions", addr),
            "key".to_string(),
            "m".to_string(),
            10,
        )
        .with_request_timeout(Duration::from_millis(200))
        .with_retry_config(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });

        let started = Instant::now();
        let err = client.complete("", "hi").await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::NetworkError);
        assert!(err.message.contains("timeout"), "{}", err.message);
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(listener);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_without_retry_budget() {
        let client = ChatCompletionsClient::new(
            "http://127.0.0.1:9/v1/chat/completions".to_string(),
            "key".to_string(),
            "m".to_string(),
            10,
        )
        .with_retry_config(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });
        let err = client.complete("", "hi").await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::NetworkError);
    }
}
