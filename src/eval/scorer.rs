use std::{collections::BTreeSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::eval::{
    driver::DriverError,
    judge::QualityJudge,
    scenario::Scenario,
    transcript::{Speaker, Transcript},
};

pub const PASS_THRESHOLD: f64 = 0.7;
pub const PARTIAL_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Partial,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS"),
            Verdict::Partial => f.write_str("PARTIAL"),
            Verdict::Fail => f.write_str("FAIL"),
        }
    }
}

pub fn classify(coverage: f64) -> Verdict {
    if coverage >= PASS_THRESHOLD {
        Verdict::Pass
    } else if coverage >= PARTIAL_THRESHOLD {
        Verdict::Partial
    } else {
        Verdict::Fail
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicCoverage {
    pub covered: BTreeSet<String>,
    pub missing: BTreeSet<String>,
    pub coverage: f64,
}

/// Case-insensitive substring match of every expected topic against the
/// agent's text. No expectations means full coverage.
pub fn topic_coverage(expected: &BTreeSet<String>, agent_text: &str) -> TopicCoverage {
    let haystack = agent_text.to_lowercase();
    let (covered, missing): (BTreeSet<String>, BTreeSet<String>) = expected
        .iter()
        .cloned()
        .partition(|topic| haystack.contains(&topic.to_lowercase()));

    let coverage = if expected.is_empty() {
        1.0
    } else {
        covered.len() as f64 / expected.len() as f64
    };

    TopicCoverage {
        covered,
        missing,
        coverage,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A conversation backend failed mid-run.
    Backend,
    /// The run was stopped before this scenario was admitted.
    Cancelled,
    /// The scenario's task died without producing a result.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<Speaker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
}

impl ErrorInfo {
    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "run stopped before this scenario started".to_string(),
            speaker: None,
            turn: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
            speaker: None,
            turn: None,
        }
    }
}

impl From<&DriverError> for ErrorInfo {
    fn from(error: &DriverError) -> Self {
        Self {
            kind: ErrorKind::Backend,
            message: error.source.to_string(),
            speaker: Some(error.speaker),
            turn: Some(error.turn),
        }
    }
}

/// Outcome of one scenario. Only the [`Scorer`] and [`ScenarioResult::error`]
/// build these, so the verdict always follows from the coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ScenarioResult {
    pub scenario: Scenario,
    pub transcript: Option<Transcript>,
    pub topic_coverage: f64,
    pub covered_topics: BTreeSet<String>,
    pub missing_topics: BTreeSet<String>,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_quality_score: Option<u8>,
    pub tool_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ScenarioResult {
    /// Result for a scenario that produced no scorable transcript. Any partial
    /// transcript is kept for inspection but never scored.
    pub fn error(scenario: Scenario, error: ErrorInfo, transcript: Option<Transcript>) -> Self {
        Self {
            covered_topics: BTreeSet::new(),
            missing_topics: scenario.expected_topics.clone(),
            topic_coverage: 0.0,
            verdict: Verdict::Fail,
            llm_quality_score: None,
            tool_used: transcript.as_ref().is_some_and(Transcript::tool_used),
            transcript,
            error: Some(error),
            scenario,
        }
    }

    pub fn from_driver_error(scenario: Scenario, error: DriverError) -> Self {
        let info = ErrorInfo::from(&error);
        Self::error(scenario, info, Some(error.transcript))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Tool use differed from what the scenario expected. Never affects the
    /// verdict.
    pub fn tool_use_mismatch(&self) -> bool {
        !self.is_error() && self.tool_used != self.scenario.expected_tool_use
    }
}

/// Derives a [`ScenarioResult`] from a finished transcript.
#[derive(Clone, Default)]
pub struct Scorer {
    judge: Option<Arc<dyn QualityJudge>>,
}

impl fmt::Debug for Scorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scorer")
            .field("judge", &self.judge.is_some())
            .finish()
    }
}

impl Scorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_judge(mut self, judge: Arc<dyn QualityJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Coverage, verdict and tool use only. Deterministic for a given input.
    pub fn score_coverage(&self, scenario: &Scenario, transcript: Transcript) -> ScenarioResult {
        let coverage = topic_coverage(&scenario.expected_topics, &transcript.agent_text());
        ScenarioResult {
            scenario: scenario.clone(),
            verdict: classify(coverage.coverage),
            topic_coverage: coverage.coverage,
            covered_topics: coverage.covered,
            missing_topics: coverage.missing,
            llm_quality_score: None,
            tool_used: transcript.tool_used(),
            transcript: Some(transcript),
            error: None,
        }
    }

    /// Full scoring including the optional quality judgment. A failed
    /// judgment leaves the score empty and changes nothing else.
    pub async fn score(&self, scenario: &Scenario, transcript: Transcript) -> ScenarioResult {
        let mut result = self.score_coverage(scenario, transcript);

        if let (Some(judge), Some(transcript)) = (&self.judge, &result.transcript) {
            match judge.judge(scenario, transcript).await {
                Ok(score) => result.llm_quality_score = Some(score),
                Err(error) => {
                    tracing::warn!(scenario = %scenario.name, %error, "quality judgment skipped");
                }
            }
        }

        result
    }
}
