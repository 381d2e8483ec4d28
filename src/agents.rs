use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time;

use crate::{
    backend::{BackendError, BackendReply, ConversationBackend},
    eval::transcript::{Speaker, ToolInvocation, Turn},
    functions::{FunctionRegistry, ToolChoice},
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMProvider,
};

const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;

pub const DEFAULT_SUPPORT_INSTRUCTIONS: &str = "You are a friendly, courteous customer support agent.\n\n\
## Role\n\
Answer customer inquiries with accurate, helpful information from the knowledge base.\n\n\
## Guidelines\n\
1. Understand the question, then search the knowledge base with suitable keywords.\n\
2. Base your answer on the search results and keep it clear.\n\
3. If nothing relevant is found, say so honestly and point the customer to direct support.\n\
4. Stay polite and empathetic.\n\n\
## Format\n\
- Keep answers concise.\n\
- Use bullet points where they help.\n\
- Explain procedures step by step.";

/// An LLM-backed conversation participant.
///
/// The agent plays one side of the conversation: turns spoken by that side are
/// replayed to the model as `assistant` messages, the other side as `user`.
/// When a function registry is attached, tool calls are executed in a loop
/// until the model produces text, and every call is reported back on the reply.
#[derive(Clone)]
pub struct Agent {
    name: String,
    instructions: String,
    plays: Speaker,
    provider: Arc<dyn LLMProvider>,
    model: String,
    functions: Option<Arc<FunctionRegistry>>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_tool_rounds: usize,
    timeout: Option<Duration>,
    retries: u32,
    retry_backoff: Duration,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("plays", &self.plays)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("has_functions", &self.functions.is_some())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish()
    }
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        plays: Speaker,
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            plays,
            provider,
            model: model.into(),
            functions: None,
            temperature: None,
            max_tokens: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            timeout: None,
            retries: 0,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Agent that answers as the support side.
    pub fn support(
        instructions: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self::new("support", instructions, Speaker::Agent, provider, model)
    }

    /// Agent that role-plays the customer. Its persona arrives per call as context.
    pub fn simulated_user(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self::new(
            "simulated-user",
            "You are role-playing a customer talking to a support agent. \
Reply only with what the customer would say next.",
            Speaker::User,
            provider,
            model,
        )
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn plays(&self) -> Speaker {
        self.plays
    }

    pub fn with_function_registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.functions = Some(registry);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    /// Deadline for each individual provider call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry transient provider failures. The n-th retry waits `n * backoff`.
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = backoff;
        self
    }

    fn system_prompt(&self, context: &str) -> String {
        if context.trim().is_empty() {
            self.instructions.clone()
        } else {
            format!("{}\n\n{}", self.instructions, context.trim())
        }
    }

    fn to_message(&self, turn: &Turn) -> ChatMessage {
        if turn.speaker == self.plays {
            ChatMessage::assistant(turn.text.clone())
        } else {
            ChatMessage::user(turn.text.clone())
        }
    }

    fn build_request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.model.clone(), messages);

        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        if let Some(functions) = self.functions.as_deref().filter(|f| !f.is_empty()) {
            request = request
                .with_function_registry(functions)
                .with_tool_choice(ToolChoice::Auto);
        }

        request
    }

    async fn complete_once(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let call = self.provider.complete(request);
        match self.timeout {
            Some(limit) => match time::timeout(limit, call).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(BackendError::Timeout(limit.as_millis() as u64)),
            },
            None => Ok(call.await?),
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let mut attempt = 0u32;
        loop {
            match self.complete_once(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) if attempt < self.retries && is_retryable(&error) => {
                    attempt += 1;
                    let delay = self.retry_backoff * attempt;
                    tracing::warn!(
                        agent = %self.name,
                        attempt,
                        error = %error,
                        "retrying provider call in {} ms",
                        delay.as_millis()
                    );
                    time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn is_retryable(error: &BackendError) -> bool {
    match error {
        BackendError::Timeout(_) => true,
        BackendError::Provider(inner) => inner.is_transient(),
        _ => false,
    }
}

#[async_trait]
impl ConversationBackend for Agent {
    async fn respond(&self, history: &[Turn], context: &str) -> Result<BackendReply, BackendError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt(context)));
        messages.extend(history.iter().map(|turn| self.to_message(turn)));

        let mut invocations = Vec::new();

        for round in 0..self.max_tool_rounds {
            let response = self.complete(self.build_request(messages.clone())).await?;
            let mut message = response.message;

            let registry = match self.functions.as_deref() {
                Some(registry) if !message.tool_calls.is_empty() => registry,
                _ => {
                    let text = message.text().unwrap_or_default().trim().to_string();
                    if text.is_empty() {
                        return Err(BackendError::EmptyReply);
                    }
                    return Ok(BackendReply {
                        text,
                        tool_invocations: invocations,
                    });
                }
            };

            for (index, call) in message.tool_calls.iter_mut().enumerate() {
                if call.id.is_none() {
                    call.id = Some(format!("call_{round}_{index}"));
                }
            }
            messages.push(message.clone());

            for call in message.tool_calls {
                let id = call.id.clone().unwrap_or_default();
                let (result, is_error) = match registry.invoke(&call.function).await {
                    Ok(serde_json::Value::String(text)) => (text, false),
                    Ok(value) => (serde_json::to_string(&value).map_err(crate::LLMError::from)?, false),
                    Err(error) => (error.to_string(), true),
                };

                tracing::debug!(
                    agent = %self.name,
                    tool = %call.function.name,
                    is_error,
                    "tool invoked"
                );

                messages.push(ChatMessage::tool(id, result.clone()));
                invocations.push(ToolInvocation {
                    name: call.function.name,
                    arguments: call.function.arguments,
                    result,
                    is_error,
                });
            }
        }

        Err(BackendError::ToolRoundsExhausted(self.max_tool_rounds))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
