use std::{
    any::Any,
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Utc;
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::eval::{
    driver::ConversationDriver,
    report::{EvaluationRun, RunConfig},
    scenario::{select_scenarios, Scenario, ScenarioError},
    scorer::{ErrorInfo, ScenarioResult, Scorer},
};

pub const DEFAULT_WORKERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Concurrent { workers: usize },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Concurrent {
            workers: DEFAULT_WORKERS,
        }
    }
}

impl ExecutionMode {
    /// Scenarios in flight at once. The CLI rejects zero workers; library
    /// callers passing zero get one.
    pub fn workers(self) -> usize {
        match self {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Concurrent { workers } => workers.max(1),
        }
    }
}

type Queue = Mutex<VecDeque<(usize, Scenario)>>;
type Slots = Mutex<Vec<Option<ScenarioResult>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs scenarios through a [`ConversationDriver`] and [`Scorer`] with a
/// bounded number of scenarios in flight.
///
/// Results come back in the order scenarios were given, whatever order they
/// finish in. A failing scenario only affects its own result.
pub struct EvalRunner {
    driver: ConversationDriver,
    scorer: Scorer,
    mode: ExecutionMode,
    start_interval: Duration,
    stop: Option<watch::Receiver<bool>>,
    config: RunConfig,
}

impl EvalRunner {
    pub fn new(driver: ConversationDriver, scorer: Scorer) -> Self {
        Self {
            driver,
            scorer,
            mode: ExecutionMode::default(),
            start_interval: Duration::ZERO,
            stop: None,
            config: RunConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Delay between worker start-ups, to spread the first burst of requests.
    pub fn with_start_interval(mut self, interval: Duration) -> Self {
        self.start_interval = interval;
        self
    }

    /// Once the receiver reads `true`, no further scenarios are started.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Descriptive settings recorded on the run (models, provider, source).
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| *stop.borrow())
    }

    /// Runs the scenario named `selection`, or all of them. An unknown name
    /// fails before any conversation starts.
    pub async fn run_selected(
        &self,
        all: &[Scenario],
        selection: Option<&str>,
    ) -> Result<EvaluationRun, ScenarioError> {
        let scenarios = select_scenarios(all, selection)?;
        Ok(self.run(scenarios).await)
    }

    pub async fn run(&self, scenarios: Vec<Scenario>) -> EvaluationRun {
        let started_at = Utc::now();
        let total = scenarios.len();
        let workers = self.mode.workers().min(total.max(1));

        tracing::info!(scenarios = total, workers, "evaluation started");

        let queue: Queue = Mutex::new(scenarios.iter().cloned().enumerate().collect());
        let slots: Slots = Mutex::new((0..total).map(|_| None).collect());

        let mut pool = FuturesUnordered::new();
        for worker in 0..workers {
            let delay = self.start_interval * worker as u32;
            pool.push(self.worker(worker, delay, total, &queue, &slots));
        }
        while pool.next().await.is_some() {}
        drop(pool);

        let mut slots = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
        let unadmitted = queue.into_inner().unwrap_or_else(PoisonError::into_inner);
        if !unadmitted.is_empty() {
            tracing::warn!(skipped = unadmitted.len(), "run stopped before every scenario started");
        }
        for (index, scenario) in unadmitted {
            slots[index] = Some(ScenarioResult::error(scenario, ErrorInfo::cancelled(), None));
        }

        let results: Vec<ScenarioResult> = slots
            .into_iter()
            .zip(scenarios)
            .map(|(slot, scenario)| {
                slot.unwrap_or_else(|| {
                    ScenarioResult::error(scenario, ErrorInfo::internal("no result recorded"), None)
                })
            })
            .collect();

        let run = EvaluationRun {
            results,
            started_at,
            finished_at: Utc::now(),
            config: RunConfig {
                execution: self.mode,
                start_interval_ms: self.start_interval.as_millis() as u64,
                ..self.config.clone()
            },
        };

        let summary = run.summary();
        tracing::info!(
            total = summary.total,
            passed = summary.passed,
            errors = summary.errors,
            pass_rate = summary.pass_rate(),
            "evaluation finished"
        );
        run
    }

    async fn worker(&self, id: usize, delay: Duration, total: usize, queue: &Queue, slots: &Slots) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        loop {
            if self.stop_requested() {
                tracing::debug!(worker = id, "stop requested, worker exiting");
                break;
            }
            let Some((index, scenario)) = lock(queue).pop_front() else {
                break;
            };
            let result = self.run_scenario(index, total, scenario).await;
            lock(slots)[index] = Some(result);
        }
    }

    async fn run_scenario(&self, index: usize, total: usize, scenario: Scenario) -> ScenarioResult {
        tracing::info!(scenario = %scenario.name, position = index + 1, total, "scenario started");

        let attempt = AssertUnwindSafe(async {
            match self.driver.run(&scenario).await {
                Ok(transcript) => self.scorer.score(&scenario, transcript).await,
                Err(error) => {
                    tracing::warn!(scenario = %scenario.name, %error, "scenario failed");
                    ScenarioResult::from_driver_error(scenario.clone(), error)
                }
            }
        })
        .catch_unwind()
        .await;

        let result = match attempt {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(scenario = %scenario.name, %message, "scenario panicked");
                ScenarioResult::error(scenario.clone(), ErrorInfo::internal(message), None)
            }
        };

        tracing::info!(
            scenario = %scenario.name,
            verdict = %result.verdict,
            coverage = result.topic_coverage,
            "scenario finished"
        );
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "scenario panicked".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        backend::{BackendError, BackendReply, ConversationBackend},
        eval::{
            scorer::ErrorKind,
            transcript::Turn,
        },
    };

    /// Answers with the opening question echoed back. Opening questions
    /// starting with `panic` panic, `stop` raises the stop signal first.
    struct Echo {
        stop: Option<watch::Sender<bool>>,
    }

    #[async_trait]
    impl ConversationBackend for Echo {
        async fn respond(&self, history: &[Turn], _context: &str) -> Result<BackendReply, BackendError> {
            let opening = history.first().map(|turn| turn.text.clone()).unwrap_or_default();
            if opening.starts_with("panic") {
                panic!("backend exploded");
            }
            if opening.starts_with("stop") {
                if let Some(stop) = &self.stop {
                    let _ = stop.send(true);
                }
            }
            Ok(BackendReply::text(format!("answer about {opening}")))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn runner(stop: Option<watch::Sender<bool>>) -> EvalRunner {
        let backend = Arc::new(Echo { stop });
        EvalRunner::new(ConversationDriver::new(backend.clone(), backend), Scorer::new())
    }

    fn scenario(name: &str, query: &str) -> Scenario {
        Scenario::new(name, query, [query]).with_max_turns(1)
    }

    #[test]
    fn sequential_mode_is_a_single_worker() {
        assert_eq!(ExecutionMode::Sequential.workers(), 1);
        assert_eq!(ExecutionMode::Concurrent { workers: 0 }.workers(), 1);
        assert_eq!(ExecutionMode::default().workers(), DEFAULT_WORKERS);
    }

    #[tokio::test]
    async fn panicking_scenario_becomes_internal_error() {
        let run = runner(None)
            .run(vec![scenario("a", "refund"), scenario("b", "panic now"), scenario("c", "shipping")])
            .await;

        assert_eq!(run.results.len(), 3);
        let error = run.results[1].error.as_ref().expect("error recorded");
        assert_eq!(error.kind, ErrorKind::Internal);
        assert_eq!(error.message, "backend exploded");
        assert!(!run.results[0].is_error());
        assert!(!run.results[2].is_error());
    }

    #[tokio::test]
    async fn stop_signal_cancels_unadmitted_scenarios() {
        let (sender, receiver) = watch::channel(false);
        let run = runner(Some(sender))
            .with_mode(ExecutionMode::Sequential)
            .with_stop_signal(receiver)
            .run(vec![scenario("first", "stop here"), scenario("second", "refund"), scenario("third", "returns")])
            .await;

        assert!(!run.results[0].is_error());
        for result in &run.results[1..] {
            assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled));
        }
        assert_eq!(run.results[2].scenario.name, "third");
    }

    #[tokio::test]
    async fn unknown_selection_fails_before_running() {
        let all = vec![scenario("a", "refund")];
        let error = runner(None).run_selected(&all, Some("b")).await.unwrap_err();
        assert!(matches!(error, ScenarioError::UnknownScenario { .. }));

        let run = runner(None).run_selected(&all, Some("a")).await.expect("known");
        assert_eq!(run.results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_records_execution_settings() {
        let run = runner(None)
            .with_mode(ExecutionMode::Concurrent { workers: 2 })
            .with_start_interval(Duration::from_millis(250))
            .with_config(RunConfig {
                support_model: Some("support-model".to_string()),
                ..RunConfig::default()
            })
            .run(vec![scenario("a", "refund"), scenario("b", "returns")])
            .await;

        assert_eq!(run.config.execution, ExecutionMode::Concurrent { workers: 2 });
        assert_eq!(run.config.start_interval_ms, 250);
        assert_eq!(run.config.support_model.as_deref(), Some("support-model"));
        assert!(run.finished_at >= run.started_at);
    }

    #[tokio::test]
    async fn empty_scenario_list_yields_empty_run() {
        let run = runner(None).run(Vec::new()).await;
        assert!(run.results.is_empty());
        assert_eq!(run.summary().total, 0);
    }
}
