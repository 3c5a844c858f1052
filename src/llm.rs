use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const RATE_LIMITED: u16 = 429;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// One completion call: a system instruction plus a single user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

/// Token counters reported by the provider. Advisory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub cache_created: u64,
    pub cache_read: u64,
    pub uncached: u64,
    pub output: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{status} {message}")]
    Status { status: u16, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("response contained no text")]
    EmptyResponse,
}

impl LlmError {
    /// True only for the provider's "too many requests" rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::Status { status, .. } if *status == RATE_LIMITED)
    }
}

/// Anything that can turn a request into generated text.
pub trait CompletionService {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<Completion, LlmError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    /// Any server speaking the OpenAI chat-completions dialect.
    OpenAi,
}

impl Provider {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "openai" | "openai-compatible" => Ok(Provider::OpenAi),
            other => bail!("unknown LLM_PROVIDER {:?} (expected anthropic or openai)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: Provider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
}

impl LlmSettings {
    pub fn from_env() -> Result<Self> {
        let provider = match dotenv::var("LLM_PROVIDER") {
            Ok(p) if !p.trim().is_empty() => Provider::parse(&p)?,
            _ => Provider::Anthropic,
        };
        let default_base = match provider {
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::OpenAi => "http://localhost:1234/v1",
        };
        let base_url =
            dotenv::var("LLM_BASE_URL").unwrap_or_else(|_| default_base.to_string());
        let model = dotenv::var("LLM_MODEL")
            .unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string());
        let api_key = api_key(|key| dotenv::var(key).ok());
        let max_tokens = match dotenv::var("LLM_MAX_TOKENS") {
            Ok(v) => v
                .trim()
                .parse()
                .with_context(|| format!("invalid value for LLM_MAX_TOKENS: {:?}", v))?,
            Err(_) => 200,
        };

        if provider == Provider::Anthropic && api_key.is_none() {
            bail!("LLM_API_KEY or ANTHROPIC_API_KEY is required for the anthropic provider");
        }

        Ok(Self {
            provider,
            base_url,
            model,
            api_key,
            max_tokens,
        })
    }
}

/// `LLM_API_KEY`, falling back to `ANTHROPIC_API_KEY`. A blank value counts as unset.
fn api_key<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    ["LLM_API_KEY", "ANTHROPIC_API_KEY"]
        .into_iter()
        .find_map(|name| lookup(name).filter(|k| !k.trim().is_empty()))
}

pub struct LlmClient {
    client: reqwest::Client,
    provider: Provider,
    base_url: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            provider: settings.provider,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    /// Resolve the provider's completion endpoint from the base URL.
    fn endpoint(&self) -> String {
        endpoint_for(self.provider, &self.base_url)
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        match self.provider {
            Provider::Anthropic => serde_json::json!({
                "model": request.model,
                "max_tokens": request.max_tokens,
                "system": request.system,
                "messages": [Message {
                    role: "user".to_string(),
                    content: request.user.clone(),
                }],
            }),
            Provider::OpenAi => serde_json::json!({
                "model": request.model,
                "max_tokens": request.max_tokens,
                "messages": [
                    Message {
                        role: "system".to_string(),
                        content: request.system.clone(),
                    },
                    Message {
                        role: "user".to_string(),
                        content: request.user.clone(),
                    },
                ],
            }),
        }
    }
}

impl CompletionService for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let mut req = self.client.post(self.endpoint()).json(&self.body(request));
        req = match (self.provider, &self.api_key) {
            (Provider::Anthropic, Some(key)) => req
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            (Provider::Anthropic, None) => req.header("anthropic-version", ANTHROPIC_VERSION),
            (Provider::OpenAi, Some(key)) => {
                req.header("Authorization", format!("Bearer {}", key))
            }
            (Provider::OpenAi, None) => req,
        };

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let json: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        parse_completion(self.provider, &json)
    }
}

fn endpoint_for(provider: Provider, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match provider {
        Provider::Anthropic => {
            if base.ends_with("/messages") {
                base.to_string()
            } else if base.ends_with("/v1") {
                format!("{}/messages", base)
            } else {
                format!("{}/v1/messages", base)
            }
        }
        Provider::OpenAi => {
            if base.ends_with("/chat/completions") {
                base.to_string()
            } else if base.ends_with("/v1") {
                format!("{}/chat/completions", base)
            } else {
                format!("{}/v1/chat/completions", base)
            }
        }
    }
}

/// Pull a human-readable message out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        json["error"]["message"]
            .as_str()
            .or_else(|| json["error"].as_str())
            .or_else(|| json["message"].as_str())
            .map(str::to_string)
    });
    match from_json {
        Some(message) => message,
        None => body.chars().take(300).collect(),
    }
}

fn parse_completion(provider: Provider, json: &Value) -> Result<Completion, LlmError> {
    let (text, usage) = match provider {
        Provider::Anthropic => {
            let text = json["content"]
                .as_array()
                .ok_or_else(|| LlmError::Decode("missing content array".to_string()))?
                .iter()
                .find_map(|block| block["text"].as_str());
            let usage = json.get("usage").map(|u| TokenUsage {
                cache_created: u["cache_creation_input_tokens"].as_u64().unwrap_or(0),
                cache_read: u["cache_read_input_tokens"].as_u64().unwrap_or(0),
                uncached: u["input_tokens"].as_u64().unwrap_or(0),
                output: u["output_tokens"].as_u64().unwrap_or(0),
            });
            (text, usage)
        }
        Provider::OpenAi => {
            // choices[0].message.content may be null
            let text = json["choices"]
                .get(0)
                .and_then(|c| c["message"]["content"].as_str());
            let usage = json.get("usage").map(|u| {
                let prompt = u["prompt_tokens"].as_u64().unwrap_or(0);
                let cached = u["prompt_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0);
                TokenUsage {
                    cache_created: 0,
                    cache_read: cached,
                    uncached: prompt.saturating_sub(cached),
                    output: u["completion_tokens"].as_u64().unwrap_or(0),
                }
            });
            (text, usage)
        }
    };

    match text.map(str::trim) {
        Some(t) if !t.is_empty() => Ok(Completion {
            text: t.to_string(),
            usage,
        }),
        _ => Err(LlmError::EmptyResponse),
    }
}
