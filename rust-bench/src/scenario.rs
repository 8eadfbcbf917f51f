use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Scenario side data carried from prompt generation to validation.
pub type Meta = BTreeMap<String, String>;

const NOISE_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ ";

/// Approximate characters per token used to size prompts.
pub const CHARS_PER_TOKEN: usize = 4;

pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds a prompt of roughly `context_len` tokens.
    fn generate_prompt(&self, context_len: usize) -> (String, Meta);

    fn validate(&self, response: &str, meta: &Meta) -> bool;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    #[default]
    Synthetic,
    #[serde(alias = "needle_in_haystack")]
    Needle,
}

impl ScenarioKind {
    pub fn build(self) -> Arc<dyn Scenario> {
        match self {
            ScenarioKind::Synthetic => Arc::new(SyntheticScenario),
            ScenarioKind::Needle => Arc::new(NeedleInHaystackScenario::default()),
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioKind::Synthetic => f.write_str("synthetic"),
            ScenarioKind::Needle => f.write_str("needle"),
        }
    }
}

impl FromStr for ScenarioKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "synthetic" => Ok(ScenarioKind::Synthetic),
            "needle" | "needle_in_haystack" => Ok(ScenarioKind::Needle),
            other => Err(format!("unknown scenario `{}`", other)),
        }
    }
}

fn noise(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| NOISE_CHARSET[rng.gen_range(0..NOISE_CHARSET.len())] as char)
        .collect()
}

/// Random letter noise sized to the target context. Any non-empty answer passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticScenario;

impl Scenario for SyntheticScenario {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn generate_prompt(&self, context_len: usize) -> (String, Meta) {
        // ~200 chars are left for the surrounding template
        let noise_len = (context_len * CHARS_PER_TOKEN).saturating_sub(200).max(100);
        let noise = noise(&mut rand::thread_rng(), noise_len);
        let prompt = format!(
            "System: You are a helpful assistant.\nContext: {}\nUser: Please summarize the context.",
            noise
        );
        (prompt, Meta::new())
    }

    fn validate(&self, response: &str, _meta: &Meta) -> bool {
        !response.trim().is_empty()
    }
}

/// Hides one fact at 50% depth of a noise haystack and asks for it back.
#[derive(Debug, Clone)]
pub struct NeedleInHaystackScenario {
    facts: Vec<(String, String)>,
}

impl Default for NeedleInHaystackScenario {
    fn default() -> Self {
        Self::with_facts(vec![
            ("The secret code is:".to_string(), "BLUE-OMEGA-99".to_string()),
            (
                "The project manager's favorite color is:".to_string(),
                "Octarine".to_string(),
            ),
            (
                "The meeting is scheduled continuously for:".to_string(),
                "256 years".to_string(),
            ),
        ])
    }
}

impl NeedleInHaystackScenario {
    pub const EXPECTED_KEY: &'static str = "expected";

    /// Uses the given `(question, answer)` pairs. An empty list falls back to
    /// the built-in facts.
    pub fn with_facts(facts: Vec<(String, String)>) -> Self {
        if facts.is_empty() {
            return Self::default();
        }
        Self { facts }
    }
}

impl Scenario for NeedleInHaystackScenario {
    fn name(&self) -> &'static str {
        "needle"
    }

    fn generate_prompt(&self, context_len: usize) -> (String, Meta) {
        let mut rng = rand::thread_rng();
        let (intro, answer) = self
            .facts
            .choose(&mut rng)
            .cloned()
            .unwrap_or_default();
        let needle = format!("{} {}.", intro, answer);

        let half = (context_len * CHARS_PER_TOKEN).saturating_sub(needle.len()) / 2;
        let prefix = noise(&mut rng, half);
        let suffix = noise(&mut rng, half);
        let prompt = format!(
            "Context:\n{}\n{}\n{}\n\nUser: {}\nAnswer:",
            prefix, needle, suffix, intro
        );

        let mut meta = Meta::new();
        meta.insert(Self::EXPECTED_KEY.to_string(), answer);
        (prompt, meta)
    }

    fn validate(&self, response: &str, meta: &Meta) -> bool {
        let expected = meta
            .get(Self::EXPECTED_KEY)
            .map(|value| value.to_lowercase())
            .unwrap_or_default();
        response.to_lowercase().contains(&expected)
    }
}
