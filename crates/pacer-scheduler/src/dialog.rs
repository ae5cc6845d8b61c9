//! Scripted voice dialog: opening lines per variant and turn replies.

use pacer_core::config::DialogConfig;
use pacer_core::{AssignedParams, Responder};
use serde::Serialize;

const VARIANTS: &[[&str; 2]] = &[
    [
        "Hello, this is a scheduled call from {company_name}.",
        "I'm calling about {topic}.",
    ],
    [
        "Hi, thanks for picking up. This is {company_name}.",
        "We wanted to follow up on {topic}.",
    ],
    [
        "Good day, this is an automated call from {company_name}.",
        "It concerns {topic}.",
    ],
    [
        "Hello, {company_name} calling.",
        "Do you have a moment to talk about {topic}?",
    ],
    [
        "Hi there, this call is from {company_name}.",
        "I'd like to check in regarding {topic}.",
    ],
    [
        "Hello, you're speaking with {company_name}.",
        "This is a short call about {topic}.",
    ],
];

const FOLLOW_UPS: &[&str] = &[
    "Could you tell me a little more about that?",
    "Thanks. Is there anything else I should know about {topic}?",
    "Understood. What would be a good next step for you?",
    "I see. When would be a better time to follow up?",
    "Thank you. Could you confirm the best way to reach you?",
];

const CLOSING: &str = "Thank you for your time. Goodbye.";
const NOT_HEARD: &str = "Sorry, I didn't catch that. Could you say it again?";

/// Lines to speak for one dialog step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DialogTurn {
    pub lines: Vec<String>,
    pub persona: Option<String>,
    pub hangup: bool,
}

/// Opening and reply text for voice attempts.
pub struct DialogScript {
    company_name: String,
    topic: String,
    max_turns: u32,
}

impl DialogScript {
    pub fn new(config: &DialogConfig) -> Self {
        Self {
            company_name: config.company_name.clone(),
            topic: config.topic.clone(),
            max_turns: config.max_turns,
        }
    }

    pub fn variant_count() -> usize {
        VARIANTS.len()
    }

    fn fill(&self, line: &str) -> String {
        let company = if self.company_name.is_empty() { "us" } else { self.company_name.as_str() };
        let topic = if self.topic.is_empty() { "your request" } else { self.topic.as_str() };
        line.replace("{company_name}", company).replace("{topic}", topic)
    }

    fn variant(&self, params: &AssignedParams) -> &'static [&'static str; 2] {
        &VARIANTS[params.variant.unwrap_or(0) % VARIANTS.len()]
    }

    /// First thing said when the callee answers. The opening fixed at placement
    /// (one-shot text, else a pooled operator message) wins over the variant line.
    pub fn opening(&self, params: &AssignedParams) -> DialogTurn {
        let line = match params.opening.as_deref().map(str::trim) {
            Some(custom) if !custom.is_empty() => custom.to_string(),
            _ => self.fill(self.variant(params)[0]),
        };
        DialogTurn {
            lines: vec![line],
            persona: params.persona.clone(),
            hangup: self.max_turns == 0,
        }
    }

    /// Reply for `turn` (1-based) after the callee said `heard`.
    pub fn reply(
        &self,
        params: &AssignedParams,
        turn: u32,
        heard: &str,
        responder: &dyn Responder,
    ) -> DialogTurn {
        let persona = params.persona.clone();
        if turn >= self.max_turns {
            return DialogTurn {
                lines: vec![CLOSING.to_string()],
                persona,
                hangup: true,
            };
        }
        let line = if turn <= 1 {
            self.fill(self.variant(params)[1])
        } else {
            self.fill(&responder.respond(heard))
        };
        DialogTurn {
            lines: vec![line],
            persona,
            hangup: false,
        }
    }
}

/// Deterministic follow-up picker keyed on what was heard.
#[derive(Debug, Default, Clone, Copy)]
pub struct FollowUpResponder;

impl Responder for FollowUpResponder {
    fn respond(&self, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return NOT_HEARD.to_string();
        }
        let idx = text.chars().count() % FOLLOW_UPS.len();
        FOLLOW_UPS[idx].to_string()
    }
}
