use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::eval::scenario::{Scenario, ScenarioError};

/// Phrase the simulated user is told to end with once its goal is met. The
/// default end-of-conversation policy recognizes it.
pub const CLOSING_PHRASE: &str = "Thank you, that's all I needed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    #[default]
    Polite,
    Frustrated,
    Confused,
    Detailed,
    Curt,
}

impl Persona {
    pub const ALL: [Persona; 5] = [
        Persona::Polite,
        Persona::Frustrated,
        Persona::Confused,
        Persona::Detailed,
        Persona::Curt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Persona::Polite => "polite",
            Persona::Frustrated => "frustrated",
            Persona::Confused => "confused",
            Persona::Detailed => "detailed",
            Persona::Curt => "curt",
        }
    }

    /// Tone, verbosity and cooperation instructions for this persona.
    pub fn profile(self) -> &'static str {
        match self {
            Persona::Polite => {
                "Play a courteous, well-mannered customer.\n\
- Use polite phrasing and thank the agent for help.\n\
- State questions clearly.\n\
- Respect the agent's answers and cooperate with their requests."
            }
            Persona::Frustrated => {
                "Play a customer who is stuck and somewhat irritated.\n\
- Express dissatisfaction with the problem, never with insults.\n\
- Show urgency and push for a quick resolution.\n\
- Prefer conclusions over long explanations."
            }
            Persona::Confused => {
                "Play a customer who does not really understand the situation.\n\
- Ask vague questions.\n\
- Restate what the agent said in other words to check understanding.\n\
- Ask for step-by-step confirmation of procedures."
            }
            Persona::Detailed => {
                "Play a customer who wants precise information.\n\
- Ask about specific conditions and exceptions.\n\
- Follow up with additional questions.\n\
- Ask where the policy is written down or for a link."
            }
            Persona::Curt => {
                "Play a terse customer with little patience.\n\
- Reply in one short sentence.\n\
- Skip greetings and pleasantries.\n\
- Cooperate only as much as needed to get an answer."
            }
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Persona {
    type Err = ScenarioError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Persona::ALL
            .into_iter()
            .find(|persona| persona.as_str() == normalized)
            .ok_or_else(|| ScenarioError::UnknownPersona(value.to_string()))
    }
}

/// Standing instructions for the simulated user in `scenario`.
pub fn user_instructions(scenario: &Scenario) -> String {
    let goal = scenario
        .user_goal
        .as_deref()
        .unwrap_or("Get a clear answer to your initial question.");
    let context = scenario.user_context.as_deref().unwrap_or("None.");

    format!(
        "{profile}\n\n\
## Your scenario\n\
- Goal: {goal}\n\
- Situation: {context}\n\n\
## Constraints\n\
- Reach your goal within {max_turns} exchanges with the support agent.\n\
- React naturally to what the support agent says.\n\
- You are the customer: do not solve the problem yourself.\n\
- Once your goal is met, reply with exactly \"{CLOSING_PHRASE}\"",
        profile = scenario.persona.profile(),
        max_turns = scenario.max_turns,
    )
}

/// Guidance for the user message that follows the agent's reply in
/// `exchange`.
pub fn turn_guidance(scenario: &Scenario, exchange: u32) -> String {
    let hint = scenario
        .conversation_flow
        .as_deref()
        .and_then(|flow| flow.iter().find(|step| step.turn == exchange));

    match hint {
        Some(step) => {
            let mut guidance = format!(
                "## Next message\nThe support agent was expected to: {}",
                step.expected_agent_action
            );
            if let Some(user_hint) = &step.user_response_hint {
                guidance.push_str(&format!("\nIn your next message: {user_hint}"));
            }
            guidance
        }
        None => {
            let goal = scenario
                .user_goal
                .as_deref()
                .unwrap_or("getting a clear answer to your initial question");
            format!(
                "## Next message\nRespond in character and keep working toward your goal: {goal}"
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::scenario::TurnHint;

    fn scenario() -> Scenario {
        let mut scenario = Scenario::new(
            "returns",
            "How do I return an item?",
            ["refund"],
        );
        scenario.user_goal = Some("Understand the return procedure".to_string());
        scenario.conversation_flow = Some(vec![TurnHint {
            turn: 1,
            expected_agent_action: "Explain the return window".to_string(),
            user_response_hint: Some("Ask who pays for shipping".to_string()),
        }]);
        scenario
    }

    #[test]
    fn parses_known_personas_case_insensitively() {
        assert_eq!("Frustrated".parse::<Persona>().expect("persona"), Persona::Frustrated);
        assert_eq!(" curt ".parse::<Persona>().expect("persona"), Persona::Curt);
        assert!(matches!(
            "angry".parse::<Persona>(),
            Err(ScenarioError::UnknownPersona(name)) if name == "angry"
        ));
    }

    #[test]
    fn every_persona_has_distinct_profile() {
        let mut profiles: Vec<_> = Persona::ALL.iter().map(|p| p.profile()).collect();
        profiles.dedup();
        assert_eq!(profiles.len(), Persona::ALL.len());
    }

    #[test]
    fn instructions_carry_goal_budget_and_closing_phrase() {
        let text = user_instructions(&scenario());
        assert!(text.contains("Understand the return procedure"));
        assert!(text.contains("within 3 exchanges"));
        assert!(text.contains(CLOSING_PHRASE));
        assert!(text.starts_with(Persona::Polite.profile()));
    }

    #[test]
    fn guidance_uses_flow_hint_when_present() {
        let scenario = scenario();
        let hinted = turn_guidance(&scenario, 1);
        assert!(hinted.contains("Explain the return window"));
        assert!(hinted.contains("Ask who pays for shipping"));

        let free = turn_guidance(&scenario, 2);
        assert!(free.contains("Understand the return procedure"));
    }
}
