use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, ValueEnum};
use colored::{ColoredString, Colorize};
use persona_eval::{
    agents::DEFAULT_SUPPORT_INSTRUCTIONS,
    eval::{
        select_scenarios, ConversationDriver, EndOfConversationPolicy, EvalRunner, EvaluationRun,
        ExecutionMode, LlmJudge, RunConfig, ScenarioResult, ScenarioSet, Scorer, Speaker, Verdict,
    },
    providers::openai::OpenAI,
    knowledge::DEFAULT_EMBEDDING_MODEL,
    Agent, FunctionRegistry, KnowledgeBase, KnowledgeSearchTool, LLMProvider,
};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderKind {
    Openai,
    Openrouter,
}

#[derive(Parser)]
#[command(name = "persona-eval")]
#[command(about = "Evaluate a support agent by talking to it with simulated customers")]
struct Args {
    /// Scenario file (JSON/YAML) or directory of scenario files
    #[arg(long, default_value = "scenarios/default_scenarios.json")]
    scenarios: PathBuf,

    /// Run only the scenario with this name
    #[arg(long)]
    scenario: Option<String>,

    /// List scenarios and exit
    #[arg(long)]
    list_scenarios: bool,

    /// Directory of markdown files searched by the support agent
    #[arg(long, default_value = "knowledge")]
    knowledge_dir: PathBuf,

    /// Embedding model used to index the knowledge base
    #[arg(long, default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Rank knowledge sections by term overlap instead of embeddings
    #[arg(long)]
    lexical_search: bool,

    /// Provider to use
    #[arg(long, value_enum, default_value = "openai")]
    provider: ProviderKind,

    /// Model for the support agent
    #[arg(long, env = "PERSONA_EVAL_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// Model for the simulated user (defaults to --model)
    #[arg(long)]
    user_model: Option<String>,

    /// Ask an LLM judge for a 1-5 quality score per scenario
    #[arg(long)]
    judge: bool,

    /// Model for the judge (defaults to --model)
    #[arg(long)]
    judge_model: Option<String>,

    /// Run scenarios one after another
    #[arg(long)]
    sequential: bool,

    /// Scenarios in flight at once
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..))]
    workers: u16,

    /// Seconds between worker start-ups
    #[arg(long, default_value_t = 1.0)]
    rate_limit_delay: f64,

    /// Write results_<timestamp>.json into this directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Print every conversation after the run
    #[arg(long)]
    show_conversations: bool,

    /// Extra regex marking a user message as the end of the conversation (repeatable)
    #[arg(long)]
    closing_pattern: Vec<String>,

    /// Exit with status 1 unless every scenario passes
    #[arg(long)]
    strict: bool,

    /// Only log warnings and errors
    #[arg(long)]
    quiet: bool,
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info,persona_eval=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_provider(kind: ProviderKind) -> Result<Arc<dyn LLMProvider>, Box<dyn std::error::Error>> {
    let provider: Arc<dyn LLMProvider> = match kind {
        ProviderKind::Openai => Arc::new(OpenAI::from_env()?),
        ProviderKind::Openrouter => Arc::new(OpenAI::openrouter_from_env()?),
    };
    Ok(provider)
}

async fn build_tools(
    knowledge_dir: &Path,
    embeddings: Option<(Arc<dyn LLMProvider>, &str)>,
) -> Result<FunctionRegistry, Box<dyn std::error::Error>> {
    let mut registry = FunctionRegistry::new();
    if knowledge_dir.is_dir() {
        let mut base = KnowledgeBase::load_dir(knowledge_dir)?;
        if let Some((provider, model)) = embeddings {
            if let Err(error) = base.build_embedding_index(provider, model).await {
                tracing::warn!(%error, "embedding index unavailable, using lexical search");
            }
        }
        registry.register(Arc::new(KnowledgeSearchTool::new(base)));
    } else {
        tracing::warn!(
            dir = %knowledge_dir.display(),
            "knowledge directory not found, support agent runs without tools"
        );
    }
    Ok(registry)
}

fn verdict_label(result: &ScenarioResult) -> ColoredString {
    if result.is_error() {
        return "ERROR".red().bold();
    }
    match result.verdict {
        Verdict::Pass => "PASS".green().bold(),
        Verdict::Partial => "PARTIAL".yellow().bold(),
        Verdict::Fail => "FAIL".red().bold(),
    }
}

fn print_results(run: &EvaluationRun, show_conversations: bool) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "EVALUATION RESULTS".bold());
    println!("{}", "=".repeat(60));

    for result in &run.results {
        let quality = result
            .llm_quality_score
            .map(|score| format!("  quality {score}/5"))
            .unwrap_or_default();
        println!(
            "  [{}] {}: {:.0}%{}",
            verdict_label(result),
            result.scenario.name,
            result.topic_coverage * 100.0,
            quality
        );
        if let Some(error) = &result.error {
            println!("       {} {}", "Error:".red(), error.message);
        } else if !result.missing_topics.is_empty() {
            let missing: Vec<&str> = result.missing_topics.iter().map(String::as_str).collect();
            println!("       Missing: {}", missing.join(", "));
        }
        if result.tool_use_mismatch() {
            println!(
                "       {} expected tool use: {}, observed: {}",
                "Note:".yellow(),
                result.scenario.expected_tool_use,
                result.tool_used
            );
        }

        if show_conversations {
            if let Some(transcript) = &result.transcript {
                println!("       ({})", transcript.termination());
                for turn in transcript.turns() {
                    let speaker = match turn.speaker {
                        Speaker::User => "user ".cyan(),
                        Speaker::Agent => "agent".magenta(),
                    };
                    println!("       {} [{}] {}", speaker, turn.index, turn.text);
                    for tool in &turn.tool_invocations {
                        println!("               -> {}({})", tool.name.dimmed(), tool.arguments);
                    }
                }
            }
        }
    }

    println!("{}", "-".repeat(60));
    print!("{}", run.summary());
    println!("  Duration: {:.1}s", run.duration().as_secs_f64());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.quiet);

    let set = ScenarioSet::load(&args.scenarios)?;

    if args.list_scenarios {
        println!("Scenarios ({}):", set.scenarios.len());
        for scenario in &set.scenarios {
            let flow = scenario
                .conversation_flow
                .as_ref()
                .map(|flow| format!(" [multi-turn: {} steps]", flow.len()))
                .unwrap_or_default();
            println!("  {}: {}{}", scenario.name.bold(), scenario.description, flow);
            println!("    persona: {}, max turns: {}", scenario.persona, scenario.max_turns);
        }
        return Ok(());
    }

    let scenarios = select_scenarios(&set.scenarios, args.scenario.as_deref())?;
    let policy = EndOfConversationPolicy::default().extend(&args.closing_pattern)?;

    let provider = build_provider(args.provider)?;
    let embeddings = (!args.lexical_search).then(|| (provider.clone(), args.embedding_model.as_str()));
    let tools = build_tools(&args.knowledge_dir, embeddings).await?;
    let user_model = args.user_model.clone().unwrap_or_else(|| args.model.clone());
    let retry_backoff = Duration::from_millis(500);

    let support = Agent::support(DEFAULT_SUPPORT_INSTRUCTIONS, provider.clone(), args.model.clone())
        .with_function_registry(Arc::new(tools))
        .with_retries(2, retry_backoff);
    let user = Agent::simulated_user(provider.clone(), user_model.clone()).with_retries(2, retry_backoff);
    let driver = ConversationDriver::new(Arc::new(support), Arc::new(user)).with_policy(policy);

    let mut scorer = Scorer::new();
    let judge_model = args
        .judge
        .then(|| args.judge_model.clone().unwrap_or_else(|| args.model.clone()));
    if let Some(model) = &judge_model {
        scorer = scorer.with_judge(Arc::new(LlmJudge::new(provider.clone(), model.clone())));
    }

    let mode = if args.sequential {
        ExecutionMode::Sequential
    } else {
        ExecutionMode::Concurrent {
            workers: usize::from(args.workers),
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing scenarios in flight");
            let _ = stop_tx.send(true);
        }
    });

    let runner = EvalRunner::new(driver, scorer)
        .with_mode(mode)
        .with_start_interval(Duration::from_secs_f64(args.rate_limit_delay.max(0.0)))
        .with_stop_signal(stop_rx)
        .with_config(RunConfig {
            provider: Some(provider.name().to_string()),
            support_model: Some(args.model.clone()),
            user_model: Some(user_model),
            judge_model,
            scenario_source: Some(args.scenarios.display().to_string()),
            ..RunConfig::default()
        });

    let run = runner.run(scenarios).await;
    print_results(&run, args.show_conversations);

    if let Some(dir) = &args.output_dir {
        let path = run.save_json(dir)?;
        println!("Results JSON saved: {}", path.display());
    }

    if args.strict && run.summary().passed != run.results.len() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_is_rejected() {
        assert!(Args::try_parse_from(["persona-eval", "--workers", "0"]).is_err());

        let args = Args::try_parse_from(["persona-eval", "--workers", "2"]).expect("valid");
        assert_eq!(args.workers, 2);
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::try_parse_from(["persona-eval"]).expect("defaults");
        assert_eq!(args.workers, 3);
        assert_eq!(args.embedding_model, DEFAULT_EMBEDDING_MODEL);
        assert!(!args.lexical_search);
    }
}
