//! Scenario-driven evaluation of a support agent against a simulated user.
//!
//! [`runner::EvalRunner`] feeds each [`scenario::Scenario`] to a
//! [`driver::ConversationDriver`], scores the resulting transcript with a
//! [`scorer::Scorer`] and collects everything into a [`report::EvaluationRun`].

pub mod driver;
pub mod judge;
pub mod persona;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod scorer;
pub mod transcript;

pub use driver::{ConversationDriver, DriverError, EndOfConversationPolicy};
pub use judge::{JudgeError, LlmJudge, QualityJudge};
pub use persona::Persona;
pub use report::{EvaluationRun, ReportError, RunConfig, RunSummary};
pub use runner::{EvalRunner, ExecutionMode};
pub use scenario::{select_scenarios, Scenario, ScenarioError, ScenarioSet, TurnHint, Violation};
pub use scorer::{ErrorInfo, ErrorKind, ScenarioResult, Scorer, Verdict};
pub use transcript::{Speaker, TerminationReason, ToolInvocation, Transcript, Turn};
