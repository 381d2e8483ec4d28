use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LLMError,
    functions::{Tool, ToolChoice},
    providers::LLMProvider,
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, Embedding, EmbeddingRequest,
        EmbeddingResponse, EmbeddingUsage, TokenUsage,
    },
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Connection settings for any OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub request_timeout: Duration,
    provider_name: &'static str,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            project: None,
            request_timeout: Duration::from_secs(60),
            provider_name: "openai",
        }
    }

    /// OpenRouter speaks the same protocol under a different base URL.
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self {
            base_url: OPENROUTER_BASE_URL.to_string(),
            provider_name: "openrouter",
            ..Self::new(api_key)
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn from_env() -> Result<Self, LLMError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| LLMError::MissingApiKey("OPENAI_API_KEY"))?;
        let mut config = OpenAIConfig::new(api_key);

        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(org) = env::var("OPENAI_ORGANIZATION") {
            config.organization = Some(org);
        }
        if let Ok(project) = env::var("OPENAI_PROJECT") {
            config.project = Some(project);
        }
        if let Some(timeout) = request_timeout_from_env() {
            config.request_timeout = timeout;
        }

        Self::from_config(config)
    }

    pub fn openrouter_from_env() -> Result<Self, LLMError> {
        let api_key = env::var("OPENROUTER_API_KEY")
            .map_err(|_| LLMError::MissingApiKey("OPENROUTER_API_KEY"))?;
        let mut config = OpenAIConfig::openrouter(api_key);
        if let Some(timeout) = request_timeout_from_env() {
            config.request_timeout = timeout;
        }
        Self::from_config(config)
    }

    pub fn from_config(config: OpenAIConfig) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder.bearer_auth(&self.config.api_key);

        if let Some(ref org) = self.config.organization {
            builder = builder.header("OpenAI-Organization", org);
        }

        if let Some(ref project) = self.config.project {
            builder = builder.header("OpenAI-Project", project);
        }

        builder
    }
}

fn request_timeout_from_env() -> Option<Duration> {
    env::var("OPENAI_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|ms| ms.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ChatMessage,
}

#[derive(Debug, Serialize)]
struct EmbeddingBody {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingListResponse {
    data: Vec<EmbeddingItem>,
    model: String,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    index: usize,
}

impl From<EmbeddingListResponse> for EmbeddingResponse {
    fn from(list: EmbeddingListResponse) -> Self {
        Self {
            data: list
                .data
                .into_iter()
                .map(|item| Embedding {
                    embedding: item.embedding,
                    index: item.index,
                })
                .collect(),
            model: list.model,
            usage: list.usage,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let CompletionRequest {
            model,
            messages,
            max_tokens,
            temperature,
            response_format,
            tools,
            tool_choice,
        } = request;

        let has_tools = !tools.is_empty();
        let body = ChatCompletionBody {
            model,
            messages,
            max_tokens,
            temperature,
            response_format,
            tools: has_tools.then_some(tools),
            tool_choice: if has_tools { tool_choice } else { None },
        };

        let response = self
            .with_default_headers(self.client.post(self.endpoint("chat/completions")))
            .json(&body)
            .send()
            .await?;
        let parsed: ChatCompletionResponse = read_json(response).await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(LLMError::InvalidResponse("response did not contain any choices"))?;

        tracing::debug!(
            provider = self.config.provider_name,
            tool_calls = choice.message.tool_calls.len(),
            "chat completion received"
        );

        Ok(CompletionResponse {
            message: choice.message,
            usage: parsed.usage,
        })
    }

    async fn create_embeddings(
        &self,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, LLMError> {
        let body = EmbeddingBody {
            model: request.model,
            input: request.input,
        };

        let response = self
            .with_default_headers(self.client.post(self.endpoint("embeddings")))
            .json(&body)
            .send()
            .await?;
        let parsed: EmbeddingListResponse = read_json(response).await?;

        tracing::debug!(
            provider = self.config.provider_name,
            vectors = parsed.data.len(),
            "embeddings received"
        );

        Ok(parsed.into())
    }

    fn name(&self) -> &'static str {
        self.config.provider_name
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, LLMError> {
    let status = response.status();

    if !status.is_success() {
        let text = response.text().await?;
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&text) {
            return Err(LLMError::Provider(envelope.error.message));
        }

        return Err(LLMError::Provider(format!("unexpected status {status}: {text}")));
    }

    Ok(response.json().await?)
}
