//! OpenAI-compatible streaming chat-completions client
//!
//! Works against any endpoint speaking the `/chat/completions` SSE dialect
//! (OpenAI, OpenRouter, vLLM, llama.cpp server, ...). The response body is
//! returned undecoded; see [`crate::stream::StreamDecoder`].

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenProvider;
use crate::config::ProviderConfig;
use crate::error::{ForkchatError, Result};
use crate::providers::base::{ByteStream, ChatRequest, Provider};

/// Streaming client for OpenAI-compatible endpoints
pub struct OpenAiProvider {
    client: Client,
    api_base: String,
    request_timeout: Duration,
    tokens: Arc<dyn TokenProvider>,
}

fn format_api_error(status: reqwest::StatusCode, body: &str) -> ForkchatError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        ForkchatError::Authentication(format!(
            "API returned error {}: {}. Check the configured API token",
            status, body
        ))
    } else {
        ForkchatError::Transport(format!("API returned error {}: {}", status, body))
    }
}

impl OpenAiProvider {
    /// Creates a client for `config.api_base`
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use forkchat::auth::StaticTokenProvider;
    /// use forkchat::config::ProviderConfig;
    /// use forkchat::providers::OpenAiProvider;
    ///
    /// let provider = OpenAiProvider::new(
    ///     &ProviderConfig::default(),
    ///     Arc::new(StaticTokenProvider::new("sk-test")),
    /// );
    /// assert!(provider.is_ok());
    /// ```
    pub fn new(config: &ProviderConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("forkchat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForkchatError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!("Initialized OpenAI-compatible provider: api_base={}", config.api_base);

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            tokens,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ByteStream> {
        let token = self.tokens.current_token().await?;

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "Sending streaming chat request"
        );

        let send = self
            .client
            .post(self.completions_url())
            .bearer_auth(token)
            .header("Accept", "text/event-stream")
            .json(request)
            .send();

        // Bounds the wait for response headers only; the body may stream longer.
        let response = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| {
                ForkchatError::Transport(format!(
                    "no response within {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                tracing::error!("Chat request failed: {}", e);
                ForkchatError::Transport(format!("request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("API returned error {}: {}", status, body);
            return Err(format_api_error(status, &body).into());
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| anyhow::Error::from(ForkchatError::Transport(e.to_string())));
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::providers::base::RequestMessage;
    use futures::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![RequestMessage::user("hi")],
            temperature: 1.0,
            top_p: 0.95,
            max_tokens: 64,
            top_k: None,
            reasoning: None,
            stream: true,
            stream_options: None,
            tools: None,
            tool_choice: None,
        }
    }

    fn provider_for(server: &MockServer) -> OpenAiProvider {
        let config = ProviderConfig {
            api_base: format!("{}/v1/", server.uri()),
            ..Default::default()
        };
        OpenAiProvider::new(&config, Arc::new(StaticTokenProvider::new("sk-test"))).unwrap()
    }

    #[tokio::test]
    async fn test_stream_chat_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: [DONE]\n\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let mut stream = provider.stream_chat(&request()).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .stream_chat(&request())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<ForkchatError>(),
            Some(ForkchatError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .stream_chat(&request())
            .await
            .err()
            .unwrap();
        match err.downcast_ref::<ForkchatError>() {
            Some(ForkchatError::Transport(msg)) => assert!(msg.contains("overloaded")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_format_api_error() {
        let err = format_api_error(reqwest::StatusCode::FORBIDDEN, "nope");
        assert!(matches!(err, ForkchatError::Authentication(_)));
        let err = format_api_error(reqwest::StatusCode::BAD_REQUEST, "bad");
        assert!(err.to_string().contains("400"));
    }
}
