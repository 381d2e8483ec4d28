use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use persona_eval::{
    eval::{
        persona::CLOSING_PHRASE, ErrorKind, ExecutionMode, Speaker, TerminationReason, Turn,
    },
    providers::scripted::ScriptedProvider,
    Agent, BackendError, BackendReply, ConversationBackend, ConversationDriver, EvalRunner,
    FunctionRegistry, KnowledgeBase, KnowledgeSearchTool, Scenario, Scorer, Verdict,
};
use serde_json::json;

/// Support stub keyed on the scenario's opening question: replies with a
/// fixed answer after a per-question delay, or fails.
struct KeyedSupport {
    answers: HashMap<String, (Result<String, String>, Duration)>,
    finished: Mutex<Vec<String>>,
}

impl KeyedSupport {
    fn new() -> Self {
        Self {
            answers: HashMap::new(),
            finished: Mutex::new(Vec::new()),
        }
    }

    fn answer(mut self, query: &str, text: &str, delay_ms: u64) -> Self {
        self.answers.insert(
            query.to_string(),
            (Ok(text.to_string()), Duration::from_millis(delay_ms)),
        );
        self
    }

    fn failure(mut self, query: &str, message: &str) -> Self {
        self.answers
            .insert(query.to_string(), (Err(message.to_string()), Duration::ZERO));
        self
    }

    fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationBackend for KeyedSupport {
    async fn respond(&self, history: &[Turn], _context: &str) -> Result<BackendReply, BackendError> {
        let query = history.first().map(|turn| turn.text.clone()).unwrap_or_default();
        let (answer, delay) = self
            .answers
            .get(&query)
            .cloned()
            .unwrap_or_else(|| (Ok("I am not sure.".to_string()), Duration::ZERO));

        tokio::time::sleep(delay).await;
        self.finished.lock().unwrap().push(query);
        answer.map(BackendReply::text).map_err(BackendError::Other)
    }

    fn name(&self) -> &str {
        "keyed-support"
    }
}

struct SilentUser;

#[async_trait]
impl ConversationBackend for SilentUser {
    async fn respond(&self, _history: &[Turn], _context: &str) -> Result<BackendReply, BackendError> {
        Ok(BackendReply::text("Could you tell me more?"))
    }

    fn name(&self) -> &str {
        "silent-user"
    }
}

fn single_turn(name: &str, query: &str, topics: &[&str]) -> Scenario {
    Scenario::new(name, query, topics.iter().copied()).with_max_turns(1)
}

#[tokio::test(start_paused = true)]
async fn results_keep_input_order_when_completion_order_differs() {
    let support = Arc::new(
        KeyedSupport::new()
            .answer("q1", "one", 500)
            .answer("q2", "two", 400)
            .answer("q3", "three", 10)
            .answer("q4", "four", 300)
            .answer("q5", "five", 10),
    );
    let runner = EvalRunner::new(
        ConversationDriver::new(support.clone(), Arc::new(SilentUser)),
        Scorer::new(),
    )
    .with_mode(ExecutionMode::Concurrent { workers: 3 });

    let scenarios: Vec<Scenario> = ["one", "two", "three", "four", "five"]
        .iter()
        .enumerate()
        .map(|(i, topic)| single_turn(&format!("s{}", i + 1), &format!("q{}", i + 1), &[*topic]))
        .collect();

    let run = runner.run(scenarios).await;

    let names: Vec<&str> = run.results.iter().map(|r| r.scenario.name.as_str()).collect();
    assert_eq!(names, vec!["s1", "s2", "s3", "s4", "s5"]);
    assert!(run.results.iter().all(|r| r.verdict == Verdict::Pass));
    assert_ne!(support.finished()[0], "q1", "scenarios should finish out of order");
}

#[tokio::test]
async fn one_failing_scenario_does_not_affect_the_others() {
    let support = Arc::new(
        KeyedSupport::new()
            .answer("q1", "refund", 0)
            .failure("q2", "upstream 503")
            .answer("q3", "refund", 0)
            .answer("q4", "refund", 0),
    );
    let runner = EvalRunner::new(
        ConversationDriver::new(support, Arc::new(SilentUser)),
        Scorer::new(),
    )
    .with_mode(ExecutionMode::Concurrent { workers: 2 });

    let scenarios = (1..=4)
        .map(|i| single_turn(&format!("s{i}"), &format!("q{i}"), &["refund"]))
        .collect();
    let run = runner.run(scenarios).await;

    assert_eq!(run.results.len(), 4);
    let failed = &run.results[1];
    let error = failed.error.as_ref().expect("error recorded");
    assert_eq!(error.kind, ErrorKind::Backend);
    assert_eq!(error.speaker, Some(Speaker::Agent));
    assert_eq!(error.turn, Some(1));
    assert!(error.message.contains("upstream 503"));
    assert_eq!(failed.verdict, Verdict::Fail);
    assert_eq!(
        failed.transcript.as_ref().map(|t| t.termination()),
        Some(TerminationReason::BackendFailure)
    );

    for index in [0, 2, 3] {
        assert!(!run.results[index].is_error());
        assert_eq!(run.results[index].verdict, Verdict::Pass);
    }
    assert_eq!(run.summary().errors, 1);
}

async fn run_with_answer(answer: &str) -> persona_eval::ScenarioResult {
    let support = Agent::support("Help.", Arc::new(ScriptedProvider::from_replies([answer])), "m");
    let user = Agent::simulated_user(Arc::new(ScriptedProvider::new()), "m");
    let runner = EvalRunner::new(
        ConversationDriver::new(Arc::new(support), Arc::new(user)),
        Scorer::new(),
    )
    .with_mode(ExecutionMode::Sequential);

    let scenario = single_turn("returns", "Can I return an item?", &["30 days", "unopened", "refund"])
        .with_expected_tool_use(false);
    let mut run = runner.run(vec![scenario]).await;
    run.results.remove(0)
}

#[tokio::test]
async fn complete_answer_passes_end_to_end() {
    let result = run_with_answer("You can return unopened items within 30 days for a refund.").await;
    assert_eq!(result.topic_coverage, 1.0);
    assert_eq!(result.verdict, Verdict::Pass);
    assert!(result.missing_topics.is_empty());
}

#[tokio::test]
async fn generic_answer_fails_end_to_end() {
    let result = run_with_answer("Please contact support.").await;
    assert_eq!(result.topic_coverage, 0.0);
    assert_eq!(result.verdict, Verdict::Fail);
    assert_eq!(result.missing_topics.len(), 3);
}

#[tokio::test]
async fn llm_conversation_respects_turn_budget_and_alternates() {
    let support = Agent::support(
        "Help.",
        Arc::new(ScriptedProvider::new().with_fallback("Here is more detail.")),
        "m",
    );
    let user = Agent::simulated_user(
        Arc::new(ScriptedProvider::new().with_fallback("What else should I know?")),
        "m",
    );
    let driver = ConversationDriver::new(Arc::new(support), Arc::new(user));
    let scenario = Scenario::new("long", "Tell me about shipping", ["detail"]).with_max_turns(3);

    let transcript = driver.run(&scenario).await.expect("transcript");

    // A turn is one user message plus the agent reply, so max_turns = 3
    // allows three exchanges and six messages, never a fourth exchange.
    assert_eq!(transcript.exchanges(), 3);
    assert_eq!(transcript.agent_turns().count(), 3);
    assert_eq!(transcript.len(), 6);
    assert!(transcript.turns().iter().all(|turn| turn.index <= 3));
    for pair in transcript.turns().windows(2) {
        assert_ne!(pair[0].speaker, pair[1].speaker);
    }
}

#[tokio::test]
async fn simulated_user_can_close_the_conversation() {
    let support = Agent::support("Help.", Arc::new(ScriptedProvider::new().with_fallback("Done.")), "m");
    let user = Agent::simulated_user(Arc::new(ScriptedProvider::from_replies([CLOSING_PHRASE])), "m");
    let driver = ConversationDriver::new(Arc::new(support), Arc::new(user));
    let scenario = Scenario::new("close", "Is it shipped?", ["done"]).with_max_turns(5);

    let transcript = driver.run(&scenario).await.expect("transcript");

    assert_eq!(transcript.termination(), TerminationReason::UserEndedConversation);
    assert_eq!(transcript.agent_turns().count(), 1);
}

#[tokio::test]
async fn knowledge_tool_calls_are_recorded_and_reported() {
    let mut base = KnowledgeBase::new();
    base.add_markdown(
        "faq.md",
        "## Return policy\nUnopened items can be returned within 30 days for a full refund.\n",
    );
    let mut registry = FunctionRegistry::new();
    registry.register(Arc::new(KnowledgeSearchTool::new(base)));

    let provider = Arc::new(
        ScriptedProvider::new()
            .tool_call("search_knowledge_base", json!({ "query": "return refund" }))
            .reply("Unopened items can be returned within 30 days for a refund."),
    );
    let support = Agent::support("Help.", provider, "m").with_function_registry(Arc::new(registry));
    let user = Agent::simulated_user(Arc::new(ScriptedProvider::new()), "m");
    let runner = EvalRunner::new(
        ConversationDriver::new(Arc::new(support), Arc::new(user)),
        Scorer::new(),
    );

    let scenario = single_turn("returns", "Can I return this?", &["30 days", "refund"]);
    let run = runner.run(vec![scenario]).await;
    let result = &run.results[0];

    assert!(result.tool_used);
    assert!(!result.tool_use_mismatch());
    let turns = result.transcript.as_ref().expect("transcript").turns();
    let invocation = &turns[1].tool_invocations[0];
    assert_eq!(invocation.name, "search_knowledge_base");
    assert!(invocation.result.contains("Return policy"));
    assert!(!invocation.is_error);
}
