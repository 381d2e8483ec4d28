use std::{collections::VecDeque, sync::Mutex, time::Duration};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    functions::{FunctionCall, ToolCall},
    providers::LLMProvider,
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, Embedding, EmbeddingRequest,
        EmbeddingResponse,
    },
    LLMError,
};

#[derive(Debug, Clone)]
enum ScriptedStep {
    Reply(String),
    ToolCalls(Vec<(String, Value)>),
    Fail(String),
}

/// Deterministic provider that replays a fixed script, one step per completion.
///
/// Used to drive agents without a network. Requests are recorded so tests can
/// inspect what a model would have been shown.
///
/// Embeddings are unsupported unless a vocabulary is set with
/// [`ScriptedProvider::with_embedding_terms`]; each text then maps to the count
/// of every vocabulary term it contains.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<(ScriptedStep, Option<Duration>)>>,
    fallback: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
    embedding_terms: Option<Vec<String>>,
    embedding_requests: Mutex<Vec<EmbeddingRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        replies
            .into_iter()
            .fold(Self::new(), |provider, reply| provider.reply(reply))
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(ScriptedStep::Reply(text.into()))
    }

    pub fn tool_call(self, name: impl Into<String>, arguments: Value) -> Self {
        self.push(ScriptedStep::ToolCalls(vec![(name.into(), arguments)]))
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(ScriptedStep::Fail(message.into()))
    }

    /// Delays the most recently added step.
    pub fn after(self, delay: Duration) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            if let Some(last) = steps.back_mut() {
                last.1 = Some(delay);
            }
        }
        self
    }

    /// Reply returned once the script is exhausted instead of an error.
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    pub fn with_embedding_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.embedding_terms = Some(terms.into_iter().map(|term| term.into().to_lowercase()).collect());
        self
    }

    pub fn embedding_requests(&self) -> Vec<EmbeddingRequest> {
        self.embedding_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|steps| steps.len()).unwrap_or(0)
    }

    fn push(self, step: ScriptedStep) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back((step, None));
        }
        self
    }

    fn next_step(&self) -> Option<(ScriptedStep, Option<Duration>)> {
        self.steps.lock().ok()?.pop_front()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let (step, delay) = match self.next_step() {
            Some(entry) => entry,
            None => match &self.fallback {
                Some(text) => (ScriptedStep::Reply(text.clone()), None),
                None => {
                    return Err(LLMError::Provider(
                        "no more scripted responses".to_string(),
                    ))
                }
            },
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let message = match step {
            ScriptedStep::Reply(text) => ChatMessage::assistant(text),
            ScriptedStep::ToolCalls(calls) => {
                let tool_calls = calls
                    .into_iter()
                    .enumerate()
                    .map(|(index, (name, arguments))| {
                        ToolCall::new(FunctionCall::new(name, arguments))
                            .with_id(format!("scripted_call_{index}"))
                    })
                    .collect();
                let mut message = ChatMessage::assistant(String::new()).with_tool_calls(tool_calls);
                message.content = None;
                message
            }
            ScriptedStep::Fail(message) => return Err(LLMError::Provider(message)),
        };

        Ok(CompletionResponse {
            message,
            usage: None,
        })
    }

    async fn create_embeddings(
        &self,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, LLMError> {
        let Some(terms) = &self.embedding_terms else {
            return Err(LLMError::Unsupported("embeddings"));
        };
        if let Ok(mut requests) = self.embedding_requests.lock() {
            requests.push(request.clone());
        }

        let data = request
            .input
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let text = text.to_lowercase();
                Embedding {
                    embedding: terms
                        .iter()
                        .map(|term| text.matches(term.as_str()).count() as f32)
                        .collect(),
                    index,
                }
            })
            .collect();

        Ok(EmbeddingResponse {
            data,
            model: request.model,
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
