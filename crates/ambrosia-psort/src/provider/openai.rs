//! OpenAI-compatible chat completion provider

use std::time::Duration;

use ambrosia_core::{HttpError, SHARED_RUNTIME, http_client};
use serde::{Deserialize, Serialize};

use super::{Provider, Request, Response};
use crate::error::ProviderError;

/// Longest slice of an error body kept in messages
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API root, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Requested completion length; 0 leaves it to the service
    pub max_tokens: u32,
    /// Per-call timeout, after which the call fails and is retried
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct OpenAi {
    config: OpenAiConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl OpenAi {
    pub fn new(mut config: OpenAiConfig) -> Self {
        let trimmed = config.base_url.trim_end_matches('/').len();
        config.base_url.truncate(trimmed);
        Self { config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url)
    }

    /// Chat request body: optional system message, then the user prompt
    fn body<'a>(&'a self, request: &'a Request) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !request.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: (self.config.max_tokens > 0).then_some(self.config.max_tokens),
        }
    }

    /// Send on the shared runtime; non-2xx statuses become `HttpError`s
    fn send(&self, builder: reqwest::RequestBuilder) -> Result<String, ProviderError> {
        let builder = builder
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.timeout);
        SHARED_RUNTIME.handle().block_on(async {
            let resp = builder.send().await.map_err(HttpError::from_reqwest)?;
            let status = resp.status();
            let body = resp.text().await.map_err(HttpError::from_reqwest)?;
            if !status.is_success() {
                return Err(HttpError::with_status(status.as_u16(), error_message(&body)).into());
            }
            Ok(body)
        })
    }
}

/// Service error message if the body carries one, else a truncated body
fn error_message(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return envelope.error.message;
    }
    let mut end = body.len().min(ERROR_BODY_LIMIT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// First choice's text and total token usage
fn parse_completion(id: usize, body: &str) -> Result<Response, ProviderError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or(ProviderError::NoChoices)?;
    let tokens = match parsed.usage {
        Some(usage) => usage.total_tokens,
        None => {
            log::debug!("request {id}: response has no usage, charging 0 tokens");
            0
        }
    };
    Ok(Response {
        id,
        completion: choice.message.content.unwrap_or_default(),
        tokens,
    })
}

impl Provider for OpenAi {
    fn infer(&self, request: &Request) -> Result<Response, ProviderError> {
        let body = serde_json::to_vec(&self.body(request))
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let builder = http_client()
            .post(self.endpoint("chat/completions"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        let text = self.send(builder)?;
        let response = parse_completion(request.id, &text)?;
        log::debug!(
            "request {}: {} tokens, completion {:?}",
            request.id,
            response.tokens,
            response.completion
        );
        Ok(response)
    }

    fn ping(&self) -> Result<(), ProviderError> {
        log::debug!("pinging {}", self.config.base_url);
        let result = self.send(http_client().get(self.endpoint("models")));
        log::debug!("ping finished: {:?}", result.as_ref().err());
        result.map(|_| ())
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}
