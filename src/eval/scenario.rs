use std::{
    collections::{BTreeSet, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::persona::Persona;

pub const DEFAULT_MAX_TURNS: u32 = 3;
/// Above this, `max_turns` is accepted but logged as suspicious.
pub const MAX_RECOMMENDED_TURNS: u32 = 20;

/// Advisory guidance for one exchange of a scripted conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnHint {
    pub turn: u32,
    pub expected_agent_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_response_hint: Option<String>,
}

/// A validated evaluation scenario with every default resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub initial_query: String,
    pub expected_topics: BTreeSet<String>,
    pub expected_tool_use: bool,
    pub persona: Persona,
    pub max_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_flow: Option<Vec<TurnHint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_number: Option<u32>,
}

impl Scenario {
    pub fn new<I, S>(name: impl Into<String>, initial_query: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            description: String::new(),
            initial_query: initial_query.into(),
            expected_topics: topics.into_iter().map(Into::into).collect(),
            expected_tool_use: true,
            persona: Persona::default(),
            max_turns: DEFAULT_MAX_TURNS,
            user_context: None,
            user_goal: None,
            conversation_flow: None,
            scenario_number: None,
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_flow(mut self, flow: Vec<TurnHint>) -> Self {
        self.conversation_flow = Some(flow);
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.user_goal = Some(goal.into());
        self
    }

    pub fn with_expected_tool_use(mut self, expected: bool) -> Self {
        self.expected_tool_use = expected;
        self
    }

    pub fn flow_step(&self, exchange: u32) -> Option<&TurnHint> {
        self.conversation_flow
            .as_deref()?
            .iter()
            .find(|step| step.turn == exchange)
    }

    /// Whether the scripted flow ends after the agent's reply in `exchange`:
    /// its last entry was reached, or the entry for this exchange gives the
    /// user nothing more to say.
    pub fn flow_ends_at(&self, exchange: u32) -> bool {
        let Some(flow) = self.conversation_flow.as_deref() else {
            return false;
        };
        if flow.last().map_or(true, |last| exchange >= last.turn) {
            return true;
        }
        self.flow_step(exchange)
            .is_some_and(|step| step.user_response_hint.is_none())
    }
}

/// One problem found while validating scenario records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub index: usize,
    pub scenario: Option<String>,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scenario {
            Some(name) => write!(f, "scenario #{} ({}): {}", self.index, name, self.message),
            None => write!(f, "scenario #{}: {}", self.index, self.message),
        }
    }
}

fn list_violations(violations: &[Violation]) -> String {
    let mut out = format!("{} invalid scenario record(s)", violations.len());
    for violation in violations {
        out.push_str("\n  - ");
        out.push_str(&violation.to_string());
    }
    out
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("{}", list_violations(.0))]
    Invalid(Vec<Violation>),
    #[error("scenario '{name}' not found (available: {})", .available.join(", "))]
    UnknownScenario { name: String, available: Vec<String> },
    #[error("unknown persona '{0}' (expected one of: polite, frustrated, confused, detailed, curt)")]
    UnknownPersona(String),
    #[error("invalid closing pattern '{pattern}': {source}")]
    InvalidClosingPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTurnHint {
    pub turn: Option<i64>,
    pub expected_agent_action: Option<String>,
    pub user_response_hint: Option<String>,
}

/// A scenario record as written in a file, before defaults and validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawScenario {
    pub name: Option<String>,
    pub description: Option<String>,
    pub initial_query: Option<String>,
    pub expected_topics: Option<Vec<String>>,
    pub expected_tool_use: Option<bool>,
    pub persona: Option<String>,
    pub max_turns: Option<i64>,
    pub user_context: Option<String>,
    pub user_goal: Option<String>,
    pub conversation_flow: Option<Vec<RawTurnHint>>,
    pub scenario_number: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDocument {
    List(Vec<RawScenario>),
    Set {
        version: Option<String>,
        description: Option<String>,
        scenarios: Vec<RawScenario>,
    },
}

impl RawDocument {
    fn into_parts(self) -> (Option<String>, Option<String>, Vec<RawScenario>) {
        match self {
            RawDocument::List(scenarios) => (None, None, scenarios),
            RawDocument::Set {
                version,
                description,
                scenarios,
            } => (version, description, scenarios),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Format::Json),
            "yaml" | "yml" => Some(Format::Yaml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSet {
    pub version: String,
    pub description: String,
    pub scenarios: Vec<Scenario>,
    pub source: Option<PathBuf>,
}

impl ScenarioSet {
    pub fn parse(text: &str, format: Format) -> Result<Self, ScenarioError> {
        let (version, description, raw) = parse_document(text, format, "<input>")?.into_parts();
        Ok(Self {
            version: version.unwrap_or_else(|| "1.0".to_string()),
            description: description.unwrap_or_default(),
            scenarios: validate(raw)?,
            source: None,
        })
    }

    /// Loads a scenario file, or every JSON/YAML file in a directory (in file
    /// name order). Records from all files are validated together so names
    /// stay unique across the whole set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let io_error = |source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        };

        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(path)
                .map_err(io_error)?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|file| Format::from_path(file).is_some())
                .collect();
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut version = None;
        let mut description = None;
        let mut raw = Vec::new();
        for file in &files {
            let text = fs::read_to_string(file).map_err(|source| ScenarioError::Io {
                path: file.clone(),
                source,
            })?;
            let format = Format::from_path(file).unwrap_or(Format::Json);
            let (file_version, file_description, records) =
                parse_document(&text, format, &file.display().to_string())?.into_parts();
            version = version.or(file_version);
            description = description.or(file_description);
            raw.extend(records);
        }

        let scenarios = validate(raw)?;
        tracing::info!(
            path = %path.display(),
            files = files.len(),
            scenarios = scenarios.len(),
            "scenarios loaded"
        );

        Ok(Self {
            version: version.unwrap_or_else(|| "1.0".to_string()),
            description: description.unwrap_or_default(),
            scenarios,
            source: Some(path.to_path_buf()),
        })
    }
}

fn parse_document(text: &str, format: Format, origin: &str) -> Result<RawDocument, ScenarioError> {
    let parse_error = |message: String| ScenarioError::Parse {
        origin: origin.to_string(),
        message,
    };
    match format {
        Format::Json => serde_json::from_str(text).map_err(|error| parse_error(error.to_string())),
        Format::Yaml => serde_yaml::from_str(text).map_err(|error| parse_error(error.to_string())),
    }
}

/// Resolves defaults and checks every record, reporting all violations at once.
pub fn validate(raw: Vec<RawScenario>) -> Result<Vec<Scenario>, ScenarioError> {
    let mut violations = Vec::new();
    let mut seen = HashSet::new();
    let mut scenarios = Vec::with_capacity(raw.len());

    for (index, record) in raw.into_iter().enumerate() {
        let label = record.name.clone();
        let mut report = |message: String| {
            violations.push(Violation {
                index,
                scenario: label.clone(),
                message,
            });
        };

        let name = non_blank(record.name);
        let description = non_blank(record.description);
        let initial_query = non_blank(record.initial_query);
        for (field, present) in [
            ("name", name.is_some()),
            ("description", description.is_some()),
            ("initial_query", initial_query.is_some()),
        ] {
            if !present {
                report(format!("missing required field '{field}'"));
            }
        }

        if let Some(name) = &name {
            if !seen.insert(name.clone()) {
                report(format!("duplicate scenario name '{name}'"));
            }
        }

        let expected_topics: BTreeSet<String> = match record.expected_topics {
            None => {
                report("missing required field 'expected_topics'".to_string());
                BTreeSet::new()
            }
            Some(topics) => {
                if topics.iter().any(|topic| topic.trim().is_empty()) {
                    report("expected_topics contains a blank topic".to_string());
                }
                let topics: BTreeSet<String> = topics
                    .into_iter()
                    .map(|topic| topic.trim().to_string())
                    .filter(|topic| !topic.is_empty())
                    .collect();
                if topics.is_empty() {
                    report("expected_topics must not be empty".to_string());
                }
                topics
            }
        };

        let max_turns = match record.max_turns {
            None => Some(DEFAULT_MAX_TURNS),
            Some(value) => match u32::try_from(value) {
                Ok(turns) if turns > 0 => Some(turns),
                _ => {
                    report(format!("max_turns must be a positive integer, got {value}"));
                    None
                }
            },
        };
        if let Some(turns) = max_turns.filter(|turns| *turns > MAX_RECOMMENDED_TURNS) {
            tracing::warn!(
                scenario = label.as_deref().unwrap_or("<unnamed>"),
                max_turns = turns,
                "max_turns is unusually high (recommended at most {MAX_RECOMMENDED_TURNS})"
            );
        }

        let persona = match record.persona.as_deref() {
            None => Some(Persona::default()),
            Some(value) => match value.parse::<Persona>() {
                Ok(persona) => Some(persona),
                Err(error) => {
                    report(error.to_string());
                    None
                }
            },
        };

        let mut flow = Vec::new();
        if let Some(steps) = record.conversation_flow.filter(|steps| !steps.is_empty()) {
            let mut previous: Option<i64> = None;
            for (position, step) in steps.into_iter().enumerate() {
                let Some(turn) = step.turn else {
                    report(format!("conversation_flow[{position}] is missing 'turn'"));
                    continue;
                };
                if let Some(limit) = max_turns {
                    if turn < 1 || turn > i64::from(limit) {
                        report(format!(
                            "conversation_flow[{position}].turn {turn} is outside 1..={limit}"
                        ));
                    }
                }
                if previous.is_some_and(|previous| turn <= previous) {
                    report(format!(
                        "conversation_flow[{position}].turn {turn} does not increase"
                    ));
                }
                previous = Some(turn);

                let Some(expected_agent_action) = non_blank(step.expected_agent_action) else {
                    report(format!(
                        "conversation_flow[{position}] is missing 'expected_agent_action'"
                    ));
                    continue;
                };
                if let Ok(turn) = u32::try_from(turn) {
                    flow.push(TurnHint {
                        turn,
                        expected_agent_action,
                        user_response_hint: non_blank(step.user_response_hint),
                    });
                }
            }
        }

        if let (Some(name), Some(description), Some(initial_query), Some(max_turns), Some(persona)) =
            (name, description, initial_query, max_turns, persona)
        {
            scenarios.push(Scenario {
                name,
                description,
                initial_query,
                expected_topics,
                expected_tool_use: record.expected_tool_use.unwrap_or(true),
                persona,
                max_turns,
                user_context: non_blank(record.user_context),
                user_goal: non_blank(record.user_goal),
                conversation_flow: (!flow.is_empty()).then_some(flow),
                scenario_number: record.scenario_number,
            });
        }
    }

    if violations.is_empty() {
        Ok(scenarios)
    } else {
        Err(ScenarioError::Invalid(violations))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

/// Picks the scenarios to run: all of them, or the one named `name`.
pub fn select_scenarios(all: &[Scenario], name: Option<&str>) -> Result<Vec<Scenario>, ScenarioError> {
    match name {
        None => Ok(all.to_vec()),
        Some(name) => all
            .iter()
            .find(|scenario| scenario.name == name)
            .map(|scenario| vec![scenario.clone()])
            .ok_or_else(|| ScenarioError::UnknownScenario {
                name: name.to_string(),
                available: all.iter().map(|scenario| scenario.name.clone()).collect(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const SET: &str = r#"{
        "version": "1.0",
        "description": "returns",
        "scenarios": [
            {
                "name": "return_policy",
                "description": "Basic return question",
                "initial_query": "How do I return an item?",
                "expected_topics": ["30 days", "unopened", "refund"]
            },
            {
                "name": "multi_turn",
                "description": "Follow-up on shipping",
                "initial_query": "My order is late",
                "expected_topics": ["tracking"],
                "persona": "frustrated",
                "max_turns": 4,
                "expected_tool_use": false,
                "conversation_flow": [
                    { "turn": 1, "expected_agent_action": "Ask for order number", "user_response_hint": "Give the number" },
                    { "turn": 2, "expected_agent_action": "Share tracking status" }
                ]
            }
        ]
    }"#;

    fn violations(result: Result<impl fmt::Debug, ScenarioError>) -> Vec<Violation> {
        match result {
            Err(ScenarioError::Invalid(violations)) => violations,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn resolves_defaults_once_at_load() {
        let set = ScenarioSet::parse(SET, Format::Json).expect("valid set");
        assert_eq!(set.version, "1.0");
        let basic = &set.scenarios[0];
        assert_eq!(basic.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(basic.persona, Persona::Polite);
        assert!(basic.expected_tool_use);
        assert!(basic.conversation_flow.is_none());

        let multi = &set.scenarios[1];
        assert_eq!(multi.persona, Persona::Frustrated);
        assert_eq!(multi.max_turns, 4);
        assert!(!multi.expected_tool_use);
        assert_eq!(multi.conversation_flow.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn accepts_bare_yaml_list() {
        let yaml = "- name: a\n  description: d\n  initial_query: q\n  expected_topics: [x]\n";
        let set = ScenarioSet::parse(yaml, Format::Yaml).expect("valid yaml");
        assert_eq!(set.scenarios.len(), 1);
        assert_eq!(set.scenarios[0].name, "a");
    }

    #[test]
    fn reports_every_violation_not_just_the_first() {
        let json = r#"[
            { "name": "a", "description": "d", "initial_query": "q", "expected_topics": [] },
            { "name": "a", "description": "d", "initial_query": "q", "expected_topics": ["x"], "max_turns": 0 },
            { "description": "d", "initial_query": "q", "expected_topics": ["x"], "persona": "angry" }
        ]"#;
        let found = violations(ScenarioSet::parse(json, Format::Json));
        let messages: Vec<_> = found.iter().map(|v| v.message.as_str()).collect();

        assert!(messages.iter().any(|m| m.contains("expected_topics must not be empty")));
        assert!(messages.iter().any(|m| m.contains("duplicate scenario name 'a'")));
        assert!(messages.iter().any(|m| m.contains("max_turns must be a positive integer")));
        assert!(messages.iter().any(|m| m.contains("missing required field 'name'")));
        assert!(messages.iter().any(|m| m.contains("unknown persona 'angry'")));
        assert_eq!(found.len(), 5);
    }

    #[test]
    fn flow_turns_must_fit_budget_and_increase() {
        let json = r#"[{
            "name": "a", "description": "d", "initial_query": "q", "expected_topics": ["x"],
            "max_turns": 2,
            "conversation_flow": [
                { "turn": 2, "expected_agent_action": "one" },
                { "turn": 1, "expected_agent_action": "two" },
                { "turn": 3, "expected_agent_action": "three" }
            ]
        }]"#;
        let found = violations(ScenarioSet::parse(json, Format::Json));
        assert_eq!(found.len(), 2);
        assert!(found[0].message.contains("does not increase"));
        assert!(found[1].message.contains("outside 1..=2"));
    }

    #[test]
    fn flow_end_detection() {
        let scenario = Scenario::new("a", "q", ["x"]).with_flow(vec![
            TurnHint {
                turn: 1,
                expected_agent_action: "greet".to_string(),
                user_response_hint: None,
            },
            TurnHint {
                turn: 2,
                expected_agent_action: "answer".to_string(),
                user_response_hint: Some("thank".to_string()),
            },
        ]);
        assert!(scenario.flow_ends_at(1));
        assert!(scenario.flow_ends_at(2));
        assert!(!Scenario::new("b", "q", ["x"]).flow_ends_at(1));
    }

    #[test]
    fn selecting_unknown_scenario_fails_before_running() {
        let set = ScenarioSet::parse(SET, Format::Json).expect("valid set");
        let picked = select_scenarios(&set.scenarios, Some("multi_turn")).expect("known");
        assert_eq!(picked.len(), 1);
        assert_eq!(select_scenarios(&set.scenarios, None).expect("all").len(), 2);

        let error = select_scenarios(&set.scenarios, Some("missing")).unwrap_err();
        assert!(error.to_string().contains("return_policy, multi_turn"));
    }

    #[test]
    fn loads_directory_and_checks_names_across_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let record = r#"[{ "name": "same", "description": "d", "initial_query": "q", "expected_topics": ["x"] }]"#;
        fs::write(dir.path().join("a.json"), record).expect("write");
        fs::write(dir.path().join("b.json"), record).expect("write");
        fs::write(dir.path().join("readme.txt"), "ignored").expect("write");

        let found = violations(ScenarioSet::load(dir.path()));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].index, 1);

        let missing = ScenarioSet::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ScenarioError::Io { .. }));
    }
}
