//! Acceptance checks for generated text.
//!
//! A [`Validator`] is resolved once from configuration and then shared by all
//! workers. It either accepts a candidate (possibly normalizing it, e.g. by
//! removing a Markdown code fence) or rejects it.

use crate::{
    error::{Error, Result},
    generator::Candidate,
};
use regex::Regex;
use std::{fmt, str::FromStr};
use tracing::{debug, trace};

/// Validation mode as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Accept everything unchanged
    #[default]
    None,
    /// Accept text whose start matches a regular expression
    Regex,
    /// Accept parseable JSON
    Json,
    /// Accept parseable YAML
    Yaml,
    /// Accept parseable TOML
    Toml,
}

impl FromStr for ValidationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "regex" | "regexp" => Ok(Self::Regex),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            other => Err(Error::config(format!("Invalid validation mode: {other}"))),
        }
    }
}

/// Structured document formats the validator can parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredFormat {
    /// JSON
    Json,
    /// YAML
    Yaml,
    /// TOML
    Toml,
}

impl StructuredFormat {
    /// Fence label used by models for this format.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        }
    }

    fn parses(self, text: &str) -> bool {
        match self {
            Self::Json => serde_json::from_str::<serde_json::Value>(text).is_ok(),
            Self::Yaml => serde_yaml::from_str::<serde_yaml::Value>(text).is_ok(),
            Self::Toml => text.parse::<toml::Table>().is_ok(),
        }
    }

    /// JSON tolerates any surrounding whitespace; YAML and TOML only lose
    /// surrounding blank lines, since leading indentation is significant.
    fn normalize(self, text: &str) -> &str {
        match self {
            Self::Json => text.trim(),
            Self::Yaml | Self::Toml => text.trim_matches('\n'),
        }
    }
}

impl fmt::Display for StructuredFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How to pick among several acceptable candidates of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// First candidate, in generator order, that validates
    #[default]
    First,
    /// Shortest normalized text among all candidates that validate
    /// (ties go to the earlier candidate)
    Shortest,
}

/// Outcome of validating one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Normalized text when accepted, the original text otherwise
    pub text: String,
    /// Whether the candidate is acceptable
    pub accepted: bool,
}

impl Verdict {
    fn accept(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            accepted: true,
        }
    }

    fn reject(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            accepted: false,
        }
    }
}

/// A resolved validation strategy.
#[derive(Debug, Clone)]
pub enum Validator {
    /// Accept everything unchanged
    Accept,
    /// Accept iff the regex matches at the start of the text
    Pattern(Regex),
    /// Accept iff the de-fenced text parses as the given format
    Structured(StructuredFormat),
}

impl Validator {
    /// Resolves a validator from the configured mode and pattern.
    ///
    /// A pattern without an explicit mode selects [`ValidationMode::Regex`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the regex is missing or invalid, or
    /// when a pattern is combined with a structured mode.
    pub fn from_config(mode: ValidationMode, pattern: Option<&str>) -> Result<Self> {
        match (mode, pattern) {
            (ValidationMode::None, None) => Ok(Self::Accept),
            (ValidationMode::None | ValidationMode::Regex, Some(pattern)) => Regex::new(pattern)
                .map(Self::Pattern)
                .map_err(|e| Error::invalid_pattern(pattern, e.to_string())),
            (ValidationMode::Regex, None) => Err(Error::config(
                "regex validation requires a regular expression",
            )),
            (ValidationMode::Json | ValidationMode::Yaml | ValidationMode::Toml, Some(_)) => {
                Err(Error::config(
                    "a regular expression cannot be combined with structured validation",
                ))
            }
            (ValidationMode::Json, None) => Ok(Self::Structured(StructuredFormat::Json)),
            (ValidationMode::Yaml, None) => Ok(Self::Structured(StructuredFormat::Yaml)),
            (ValidationMode::Toml, None) => Ok(Self::Structured(StructuredFormat::Toml)),
        }
    }

    /// Validates and normalizes one candidate text.
    #[must_use]
    pub fn validate(&self, text: &str) -> Verdict {
        match self {
            Self::Accept => Verdict::accept(text),
            Self::Pattern(regex) => {
                if regex.find(text).is_some_and(|m| m.start() == 0) {
                    Verdict::accept(text)
                } else {
                    debug!("Rejected generation: does not match pattern");
                    trace!(text, "Rejected text");
                    Verdict::reject(text)
                }
            }
            Self::Structured(format) => {
                let normalized = format.normalize(extract_code_block(text, format.label()));
                if format.parses(normalized) {
                    Verdict::accept(normalized)
                } else {
                    debug!(%format, "Rejected generation: not parseable");
                    trace!(text, "Rejected text");
                    Verdict::reject(text)
                }
            }
        }
    }

    /// Picks the accepted output among one attempt's candidates.
    ///
    /// Returns `None` when no candidate validates.
    #[must_use]
    pub fn select(&self, candidates: &[Candidate], policy: SelectionPolicy) -> Option<String> {
        let mut accepted = candidates
            .iter()
            .map(|c| self.validate(&c.text))
            .filter(|v| v.accepted)
            .map(|v| v.text);

        match policy {
            SelectionPolicy::First => accepted.next(),
            SelectionPolicy::Shortest => accepted.reduce(|best, next| {
                if next.chars().count() < best.chars().count() {
                    next
                } else {
                    best
                }
            }),
        }
    }
}

/// Extracts the body of a Markdown code block.
///
/// Looks for the first fence labeled `label` (case-insensitive), falling back
/// to the first bare fence, and slices up to the last closing fence. Text
/// wrapped in single backticks is unwrapped. Anything else is returned as is.
#[must_use]
pub fn extract_code_block<'a>(text: &'a str, label: &str) -> &'a str {
    const FENCE: &str = "```";

    let stripped = text.trim();
    // ASCII lowercasing keeps byte offsets aligned with `stripped`.
    let lowered = stripped.to_ascii_lowercase();
    let labeled = format!("{FENCE}{}", label.to_ascii_lowercase());

    for prefix in [labeled.as_str(), FENCE] {
        if let (Some(start), Some(end)) = (lowered.find(prefix), lowered.rfind(FENCE)) {
            let body = start + prefix.len();
            if start < end && body <= end {
                return &stripped[body..end];
            }
        }
    }

    if stripped.starts_with('`') || stripped.ends_with('`') {
        return stripped.trim_matches('`');
    }

    text
}
