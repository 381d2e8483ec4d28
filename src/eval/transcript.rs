use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn other(self) -> Self {
        match self {
            Speaker::User => Speaker::Agent,
            Speaker::Agent => Speaker::User,
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => f.write_str("user"),
            Speaker::Agent => f.write_str("agent"),
        }
    }
}

/// One tool call made by the support agent while producing a turn, recorded
/// exactly as it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Exchange number, starting at 1. A user message and the agent reply to
    /// it share the same index.
    pub index: u32,
    pub speaker: Speaker,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxTurnsReached,
    FlowExhausted,
    /// The simulated user closed the conversation.
    UserEndedConversation,
    BackendFailure,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TerminationReason::MaxTurnsReached => "max turns reached",
            TerminationReason::FlowExhausted => "conversation flow exhausted",
            TerminationReason::UserEndedConversation => "user ended conversation",
            TerminationReason::BackendFailure => "backend failure",
        };
        f.write_str(label)
    }
}

/// The finished record of one scenario run. Only the conversation driver
/// creates transcripts; everything else reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    scenario_name: String,
    turns: Vec<Turn>,
    termination: TerminationReason,
}

impl Transcript {
    pub fn scenario_name(&self) -> &str {
        &self.scenario_name
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn termination(&self) -> TerminationReason {
        self.termination
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Number of exchanges the conversation reached.
    pub fn exchanges(&self) -> u32 {
        self.turns.last().map_or(0, |turn| turn.index)
    }

    pub fn agent_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|turn| turn.speaker == Speaker::Agent)
    }

    /// All agent text joined with newlines, the haystack for topic matching.
    pub fn agent_text(&self) -> String {
        self.agent_turns()
            .map(|turn| turn.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_used(&self) -> bool {
        self.turns.iter().any(|turn| !turn.tool_invocations.is_empty())
    }
}

/// Append-only builder that enforces speaker alternation.
#[derive(Debug)]
pub(crate) struct TranscriptBuilder {
    scenario_name: String,
    turns: Vec<Turn>,
}

impl TranscriptBuilder {
    pub(crate) fn new(scenario_name: impl Into<String>) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            turns: Vec::new(),
        }
    }

    pub(crate) fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Speaker expected next; conversations always open with the user.
    pub(crate) fn next_speaker(&self) -> Speaker {
        self.turns
            .last()
            .map_or(Speaker::User, |turn| turn.speaker.other())
    }

    pub(crate) fn push_user(&mut self, index: u32, text: impl Into<String>) {
        self.push(Turn {
            index,
            speaker: Speaker::User,
            text: text.into(),
            tool_invocations: Vec::new(),
        });
    }

    pub(crate) fn push_agent(
        &mut self,
        index: u32,
        text: impl Into<String>,
        tool_invocations: Vec<ToolInvocation>,
    ) {
        self.push(Turn {
            index,
            speaker: Speaker::Agent,
            text: text.into(),
            tool_invocations,
        });
    }

    fn push(&mut self, turn: Turn) {
        debug_assert_eq!(turn.speaker, self.next_speaker(), "speakers must alternate");
        self.turns.push(turn);
    }

    pub(crate) fn finish(self, termination: TerminationReason) -> Transcript {
        Transcript {
            scenario_name: self.scenario_name,
            turns: self.turns,
            termination,
        }
    }
}

#[cfg(test)]
pub(crate) fn transcript_from_agent_text(
    scenario_name: &str,
    user: &str,
    agent: &str,
    tool_invocations: Vec<ToolInvocation>,
) -> Transcript {
    let mut builder = TranscriptBuilder::new(scenario_name);
    builder.push_user(1, user);
    builder.push_agent(1, agent, tool_invocations);
    builder.finish(TerminationReason::MaxTurnsReached)
}
