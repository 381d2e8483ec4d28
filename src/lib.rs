pub mod agents;
pub mod backend;
pub mod error;
pub mod eval;
pub mod functions;
pub mod knowledge;
pub mod providers;
pub mod types;

pub use agents::Agent;
pub use backend::{BackendError, BackendReply, ConversationBackend};
pub use error::LLMError;
pub use eval::{
    ConversationDriver, EvalRunner, EvaluationRun, ExecutionMode, Persona, RunSummary, Scenario,
    ScenarioResult, ScenarioSet, Scorer, Transcript, Verdict,
};
pub use functions::{
    DynKernelFunction, FunctionCall, FunctionDefinition, FunctionRegistry, KernelFunction, Tool,
    ToolCall, ToolChoice,
};
pub use knowledge::{KnowledgeBase, KnowledgeSearchTool};
pub use providers::LLMProvider;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    MessageRole, TokenUsage,
};
