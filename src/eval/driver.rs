use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::{
    backend::{BackendError, ConversationBackend},
    eval::{
        persona,
        scenario::{Scenario, ScenarioError},
        transcript::{Speaker, TerminationReason, Transcript, TranscriptBuilder},
    },
};

// Closing phrases only count at the end of the message, optionally followed
// by a short thanks.
static RE_CLOSING_EN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        \b(
            that['’]?s \s+ all \s+ i \s+ (needed|wanted|had) (\s+ to \s+ know)?
          | that \s+ answers \s+ (everything|my \s+ question)
          | (good)?bye
          | have \s+ a \s+ (nice|good|great) \s+ day
        )
        ( \s* [,.!]? \s* (thanks|thank \s+ you) (\s+ (so \s+ much|again))? )?
        \s* [.!]* \s* $",
    )
    .unwrap()
});

static RE_CLOSING_JA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ありがとうございました|ありがとうございます|助かりました").unwrap());

/// Decides whether a simulated-user message closes the conversation. A
/// message ending in a question mark never does.
#[derive(Debug, Clone)]
pub struct EndOfConversationPolicy {
    patterns: Vec<Regex>,
}

impl Default for EndOfConversationPolicy {
    fn default() -> Self {
        Self {
            patterns: vec![RE_CLOSING_EN.clone(), RE_CLOSING_JA.clone()],
        }
    }
}

impl EndOfConversationPolicy {
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, ScenarioError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(pattern).map_err(|source| ScenarioError::InvalidClosingPattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Adds custom patterns on top of the current ones.
    pub fn extend<I, S>(mut self, patterns: I) -> Result<Self, ScenarioError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.patterns.extend(Self::from_patterns(patterns)?.patterns);
        Ok(self)
    }

    pub fn is_closing(&self, text: &str) -> bool {
        let text = text.trim();
        if text.ends_with('?') || text.ends_with('？') {
            return false;
        }
        self.patterns.iter().any(|pattern| pattern.is_match(text))
    }
}

/// A backend failed mid-conversation. The transcript holds every turn that
/// completed before the failure.
#[derive(Debug, Error)]
#[error("{speaker} backend failed at turn {turn}: {source}")]
pub struct DriverError {
    pub speaker: Speaker,
    pub turn: u32,
    #[source]
    pub source: BackendError,
    pub transcript: Transcript,
}

/// Runs one scenario as an alternating conversation between the simulated
/// user and the support agent.
#[derive(Clone)]
pub struct ConversationDriver {
    support: Arc<dyn ConversationBackend>,
    user: Arc<dyn ConversationBackend>,
    policy: EndOfConversationPolicy,
}

impl ConversationDriver {
    pub fn new(support: Arc<dyn ConversationBackend>, user: Arc<dyn ConversationBackend>) -> Self {
        Self {
            support,
            user,
            policy: EndOfConversationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: EndOfConversationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn run(&self, scenario: &Scenario) -> Result<Transcript, DriverError> {
        let mut builder = TranscriptBuilder::new(scenario.name.clone());
        let user_context = persona::user_instructions(scenario);

        builder.push_user(1, scenario.initial_query.clone());
        let mut exchange = 1u32;

        loop {
            tracing::debug!(scenario = %scenario.name, turn = exchange, speaker = %Speaker::Agent, "requesting reply");
            let reply = match self.support.respond(builder.turns(), "").await {
                Ok(reply) => reply,
                Err(source) => return Err(fail(builder, Speaker::Agent, exchange, source)),
            };
            builder.push_agent(exchange, reply.text, reply.tool_invocations);

            if exchange >= scenario.max_turns {
                return Ok(finish(builder, scenario, TerminationReason::MaxTurnsReached));
            }
            if scenario.flow_ends_at(exchange) {
                return Ok(finish(builder, scenario, TerminationReason::FlowExhausted));
            }

            let context = format!(
                "{user_context}\n\n{}",
                persona::turn_guidance(scenario, exchange)
            );
            exchange += 1;

            tracing::debug!(scenario = %scenario.name, turn = exchange, speaker = %Speaker::User, "requesting reply");
            let message = match self.user.respond(builder.turns(), &context).await {
                Ok(reply) => reply.text,
                Err(source) => return Err(fail(builder, Speaker::User, exchange, source)),
            };
            let closing = self.policy.is_closing(&message);
            builder.push_user(exchange, message);

            if closing {
                return Ok(finish(builder, scenario, TerminationReason::UserEndedConversation));
            }
        }
    }
}

fn finish(builder: TranscriptBuilder, scenario: &Scenario, reason: TerminationReason) -> Transcript {
    let transcript = builder.finish(reason);
    tracing::debug!(
        scenario = %scenario.name,
        turns = transcript.len(),
        reason = %reason,
        "conversation finished"
    );
    transcript
}

fn fail(builder: TranscriptBuilder, speaker: Speaker, turn: u32, source: BackendError) -> DriverError {
    DriverError {
        speaker,
        turn,
        source,
        transcript: builder.finish(TerminationReason::BackendFailure),
    }
}
