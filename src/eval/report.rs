use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::{
    runner::ExecutionMode,
    scorer::{Scorer, ScenarioResult, Verdict},
};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Settings a run was executed with, stored alongside its results.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunConfig {
    pub execution: ExecutionMode,
    pub start_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_source: Option<String>,
}

/// All results of one evaluation run, in the order scenarios were requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub results: Vec<ScenarioResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: RunConfig,
}

#[derive(Serialize)]
struct ResultsDocument<'a> {
    summary: RunSummary,
    #[serde(flatten)]
    run: &'a EvaluationRun,
}

impl EvaluationRun {
    pub fn summary(&self) -> RunSummary {
        RunSummary::from_results(&self.results)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Writes `results_<timestamp>.json` into `dir` and returns its path.
    pub fn save_json(&self, dir: impl AsRef<Path>) -> Result<PathBuf, ReportError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| ReportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(format!(
            "results_{}.json",
            self.started_at.format("%Y%m%d_%H%M%S")
        ));
        let document = ResultsDocument {
            summary: self.summary(),
            run: self,
        };
        let json = serde_json::to_string_pretty(&document)?;
        fs::write(&path, json).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::info!(path = %path.display(), "results saved");
        Ok(path)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Re-derives every scorable result from its stored transcript. Error
    /// results stay as they are.
    pub async fn rescore(&mut self, scorer: &Scorer) {
        for result in &mut self.results {
            if result.is_error() {
                continue;
            }
            if let Some(transcript) = result.transcript.clone() {
                *result = scorer.score(&result.scenario, transcript).await;
            }
        }
    }
}

/// Run-level aggregates, computed once after every scenario finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub partial: usize,
    /// Scored as failing; errored scenarios are counted separately.
    pub failed: usize,
    pub errors: usize,
    pub average_coverage: f64,
    /// Agent replies per conversation, errors excluded.
    pub average_turns: f64,
    /// Mean over results that carry a quality score.
    pub average_quality: Option<f64>,
    pub tool_use_mismatches: Vec<String>,
}

impl RunSummary {
    pub fn from_results(results: &[ScenarioResult]) -> Self {
        let total = results.len();
        let count = |verdict: Verdict| {
            results
                .iter()
                .filter(|r| !r.is_error() && r.verdict == verdict)
                .count()
        };
        let errors = results.iter().filter(|r| r.is_error()).count();

        let mean = |values: &[f64]| {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };

        let coverages: Vec<f64> = results.iter().map(|r| r.topic_coverage).collect();
        let turns: Vec<f64> = results
            .iter()
            .filter(|r| !r.is_error())
            .filter_map(|r| r.transcript.as_ref())
            .map(|t| t.agent_turns().count() as f64)
            .collect();
        let qualities: Vec<f64> = results
            .iter()
            .filter_map(|r| r.llm_quality_score.map(f64::from))
            .collect();

        Self {
            total,
            passed: count(Verdict::Pass),
            partial: count(Verdict::Partial),
            failed: count(Verdict::Fail),
            errors,
            average_coverage: mean(&coverages).unwrap_or(0.0),
            average_turns: mean(&turns).unwrap_or(0.0),
            average_quality: mean(&qualities),
            tool_use_mismatches: results
                .iter()
                .filter(|r| r.tool_use_mismatch())
                .map(|r| r.scenario.name.clone())
                .collect(),
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 / self.total as f64
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Evaluation summary: {}/{} passed", self.passed, self.total)?;
        writeln!(f, "  Pass rate: {:.1}%", self.pass_rate() * 100.0)?;
        writeln!(f, "  Partial: {}  Failed: {}  Errors: {}", self.partial, self.failed, self.errors)?;
        writeln!(f, "  Avg coverage: {:.1}%", self.average_coverage * 100.0)?;
        writeln!(f, "  Avg turns: {:.1}", self.average_turns)?;
        if let Some(quality) = self.average_quality {
            writeln!(f, "  Avg quality: {quality:.2}/5")?;
        }
        if !self.tool_use_mismatches.is_empty() {
            writeln!(f, "  Unexpected tool use: {}", self.tool_use_mismatches.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{
        scenario::Scenario,
        scorer::ErrorInfo,
        transcript::transcript_from_agent_text,
    };

    fn scored(name: &str, topics: &[&str], answer: &str) -> ScenarioResult {
        let scenario = Scenario::new(name, "q", topics.iter().copied()).with_expected_tool_use(false);
        let transcript = transcript_from_agent_text(name, "q", answer, Vec::new());
        Scorer::new().score_coverage(&scenario, transcript)
    }

    fn run(results: Vec<ScenarioResult>) -> EvaluationRun {
        let started_at = Utc::now();
        EvaluationRun {
            results,
            started_at,
            finished_at: started_at + chrono::Duration::seconds(3),
            config: RunConfig::default(),
        }
    }

    #[test]
    fn summary_counts_each_outcome_once() {
        let results = vec![
            scored("pass", &["refund"], "refund"),
            scored("partial", &["a", "b"], "a"),
            scored("fail", &["x"], "nothing"),
            ScenarioResult::error(Scenario::new("err", "q", ["y"]), ErrorInfo::cancelled(), None),
        ];
        let summary = RunSummary::from_results(&results);

        assert_eq!(summary.total, 4);
        assert_eq!((summary.passed, summary.partial, summary.failed, summary.errors), (1, 1, 1, 1));
        assert_eq!(summary.pass_rate(), 0.25);
        assert!((summary.average_coverage - 0.375).abs() < 1e-9);
        assert_eq!(summary.average_turns, 1.0);
        assert_eq!(summary.average_quality, None);
        assert!(summary.to_string().contains("1/4 passed"));
    }

    #[test]
    fn empty_run_has_zero_pass_rate() {
        let summary = RunSummary::from_results(&[]);
        assert_eq!(summary.pass_rate(), 0.0);
        assert_eq!(summary.average_coverage, 0.0);
    }

    #[test]
    fn saves_and_reloads_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = run(vec![scored("pass", &["refund"], "refund")]);

        let path = original.save_json(dir.path().join("out")).expect("save");
        assert!(path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("results_") && name.ends_with(".json")));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["summary"]["passed"], 1);

        let reloaded = EvaluationRun::load_json(&path).expect("load");
        assert_eq!(reloaded, original);
        assert_eq!(reloaded.duration(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn rescore_rederives_from_transcripts() {
        let mut evaluation = run(vec![
            scored("pass", &["refund"], "refund"),
            ScenarioResult::error(Scenario::new("err", "q", ["y"]), ErrorInfo::internal("boom"), None),
        ]);
        let before = evaluation.clone();
        evaluation.rescore(&Scorer::new()).await;
        assert_eq!(evaluation, before);
    }
}
