use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::{
    eval::{scenario::Scenario, transcript::Transcript},
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

const RUBRIC: &str = "You grade customer support conversations.\n\
Score the support agent's answers from 1 to 5:\n\
5 = fully correct and complete, addresses every expected topic\n\
4 = correct with minor omissions\n\
3 = partially correct or noticeably incomplete\n\
2 = mostly unhelpful or contains errors\n\
1 = incorrect or irrelevant\n\
Reply with JSON only: {\"score\": <1-5>, \"reason\": \"<one sentence>\"}";

static RE_SCORE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"?score"?\s*[:=]\s*"?(\d+)"#).unwrap());

static RE_BARE_SCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([1-5])\s*(/\s*5)?\s*\.?\s*$").unwrap());

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error("judge call timed out after {0} ms")]
    Timeout(u64),
    #[error("judge reply has no usable score: {0}")]
    Unparseable(String),
    #[error("judge score {0} is outside 1..=5")]
    OutOfRange(i64),
}

/// Scores a finished conversation from 1 (irrelevant) to 5 (complete).
#[async_trait]
pub trait QualityJudge: Send + Sync {
    async fn judge(&self, scenario: &Scenario, transcript: &Transcript) -> Result<u8, JudgeError>;
}

/// Quality judge backed by a single chat completion with a fixed rubric.
#[derive(Clone)]
pub struct LlmJudge {
    provider: Arc<dyn LLMProvider>,
    model: String,
    timeout: Option<Duration>,
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn prompt(scenario: &Scenario, transcript: &Transcript) -> String {
        let mut prompt = format!(
            "Customer question: {}\nExpected topics: {}\n\nConversation:\n",
            scenario.initial_query,
            scenario
                .expected_topics
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
        for turn in transcript.turns() {
            prompt.push_str(&format!("[{}] {}: {}\n", turn.index, turn.speaker, turn.text));
        }
        prompt
    }
}

#[async_trait]
impl QualityJudge for LlmJudge {
    async fn judge(&self, scenario: &Scenario, transcript: &Transcript) -> Result<u8, JudgeError> {
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(RUBRIC),
                ChatMessage::user(Self::prompt(scenario, transcript)),
            ],
        )
        .with_temperature(0.0)
        .with_max_tokens(200)
        .with_response_format(json!({ "type": "json_object" }));

        let call = self.provider.complete(request);
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| JudgeError::Timeout(limit.as_millis() as u64))??,
            None => call.await?,
        };

        let text = response.message.text().unwrap_or_default();
        let score = parse_score(text)?;
        tracing::debug!(scenario = %scenario.name, score, "quality judged");
        Ok(score)
    }
}

#[derive(Deserialize)]
struct Verdict {
    score: i64,
}

/// Extracts a 1-5 score from a judge reply: a JSON object, a `score: n`
/// fragment, or a bare number.
pub fn parse_score(text: &str) -> Result<u8, JudgeError> {
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let raw = serde_json::from_str::<Verdict>(trimmed)
        .ok()
        .map(|verdict| verdict.score)
        .or_else(|| {
            RE_SCORE_FIELD
                .captures(trimmed)
                .or_else(|| RE_BARE_SCORE.captures(trimmed))
                .and_then(|captures| captures.get(1))
                .and_then(|value| value.as_str().parse::<i64>().ok())
        })
        .ok_or_else(|| JudgeError::Unparseable(trimmed.chars().take(120).collect()))?;

    match u8::try_from(raw) {
        Ok(score) if (1..=5).contains(&score) => Ok(score),
        _ => Err(JudgeError::OutOfRange(raw)),
    }
}
