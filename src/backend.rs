use async_trait::async_trait;
use thiserror::Error;

use crate::eval::transcript::{ToolInvocation, Turn};
use crate::LLMError;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error("backend call timed out after {0} ms")]
    Timeout(u64),
    #[error("tool loop did not settle within {0} rounds")]
    ToolRoundsExhausted(usize),
    #[error("backend returned an empty reply")]
    EmptyReply,
    #[error("{0}")]
    Other(String),
}

/// Text produced by a backend for one turn, plus any tools it called on the way.
#[derive(Debug, Clone, Default)]
pub struct BackendReply {
    pub text: String,
    pub tool_invocations: Vec<ToolInvocation>,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_invocations: Vec::new(),
        }
    }
}

/// A conversational participant: the support agent under test or the
/// simulated user. `context` carries per-call guidance layered on top of the
/// backend's own instructions.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn respond(&self, history: &[Turn], context: &str) -> Result<BackendReply, BackendError>;

    fn name(&self) -> &str;
}
