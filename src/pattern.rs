//! Ordered extraction rules for pulling a public tunnel URL out of
//! free-form process output.

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;

use crate::launcher_log;

/// Built-in rules for cloudflared quick tunnels, most specific banner first.
pub const DEFAULT_RULES: &[(&str, &str)] = &[
    (
        "quick-tunnel-banner",
        r"(?i)Your quick Tunnel:\s*(https://[a-z0-9-]+\.trycloudflare\.com)",
    ),
    (
        "visit-banner",
        r"(?i)Visit\s+(https://[a-z0-9-]+\.trycloudflare\.com)",
    ),
    ("bare-url", r"(?i)(https://[a-z0-9-]+\.trycloudflare\.com)"),
];

#[derive(Clone, Debug, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
}

pub fn default_rule_configs() -> Vec<RuleConfig> {
    DEFAULT_RULES
        .iter()
        .map(|(name, pattern)| RuleConfig {
            name: (*name).to_string(),
            pattern: (*pattern).to_string(),
        })
        .collect()
}

/// One rule: the URL is capture group 1 when the pattern has one, otherwise
/// the whole match.
#[derive(Clone, Debug)]
pub struct ExtractionRule {
    name: String,
    regex: Regex,
}

impl ExtractionRule {
    pub fn new(name: impl Into<String>, pattern: &str) -> anyhow::Result<Self> {
        let name = name.into();
        let regex = Regex::new(pattern)
            .with_context(|| format!("invalid extraction rule '{name}': {pattern}"))?;
        Ok(Self { name, regex })
    }

    pub fn apply<'a>(&self, chunk: &'a str) -> Option<&'a str> {
        let captures = self.regex.captures(chunk)?;
        let found = captures.get(1).or_else(|| captures.get(0))?;
        let value = found.as_str().trim();
        if value.is_empty() { None } else { Some(value) }
    }
}

#[derive(Clone, Debug)]
pub struct PatternMatcher {
    rules: Vec<ExtractionRule>,
}

impl PatternMatcher {
    pub fn new(rules: Vec<ExtractionRule>) -> Self {
        Self { rules }
    }

    pub fn cloudflare() -> anyhow::Result<Self> {
        Self::from_configs(&default_rule_configs())
    }

    pub fn from_configs(configs: &[RuleConfig]) -> anyhow::Result<Self> {
        let rules = configs
            .iter()
            .map(|rule| ExtractionRule::new(rule.name.clone(), &rule.pattern))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if rules.is_empty() {
            anyhow::bail!("at least one extraction rule is required");
        }
        Ok(Self::new(rules))
    }

    /// Returns the first non-empty match. Rule order decides ties, not the
    /// position of the match inside `chunk`.
    pub fn extract(&self, chunk: &str) -> Option<String> {
        self.rules.iter().find_map(|rule| {
            let url = rule.apply(chunk)?;
            launcher_log::trace(module_path!(), format!("rule {} matched {url}", rule.name));
            Some(url.to_string())
        })
    }

    /// Interprets the contents of a recovery record. A clean single URL is
    /// taken as-is when a rule accepts it; anything else is scanned.
    pub fn parse_recovery(&self, contents: &str) -> Option<String> {
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return None;
        }
        if is_clean_url(trimmed)
            && let Some(url) = self.extract(trimmed)
            && url == trimmed
        {
            return Some(url);
        }
        self.extract(contents)
    }
}

fn is_clean_url(value: &str) -> bool {
    value.starts_with("https://") && !value.contains(char::is_whitespace)
}
