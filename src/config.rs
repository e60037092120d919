use crate::emit::OutputMode;
use crate::error::{Error, Result};
use crate::token::TokenizerKind;
use crate::validate::{SelectionPolicy, ValidationMode};
use encoding_rs::Encoding;
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 1;
const DEFAULT_CANDIDATES: u32 = 1;

/// Default system prompt: summarize the fragment.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a document processor. \
Provide a concise summary of the text or code provided.\n\
Be factual, do not make any guesses. \
Stick only to what is written here. \
Do NOT use any external sources. \
Do NOT judge. \
Do NOT apologise. \
Do NOT refer to your knowledge cut-off date.";

/// What a worker does when the generator call itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportErrorPolicy {
    /// Count the error as a failed attempt and retry while attempts remain
    #[default]
    Retry,
    /// Stop the whole run and return the error
    Abort,
}

/// Run-level configuration of the pipeline.
///
/// Model-dependent limits (chunk size against the context window, the derived
/// generation length) are checked by [`crate::Pipeline::new`]; everything
/// that can be checked on its own is checked by [`RunConfigBuilder::build`].
///
/// Use [`RunConfig::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RunConfig {
    /// Chunk size in tokens (default: a third of the context window)
    pub chunk_size: Option<usize>,

    /// Tokens shared between consecutive chunks of a file
    pub chunk_overlap: usize,

    /// Maximum tokens to generate (default: context left after prompt and chunk)
    pub max_tokens: Option<usize>,

    /// Worker count and input queue capacity (default: from the model)
    pub parallelism: Option<usize>,

    /// Simultaneous generator calls (default: the effective parallelism)
    pub max_concurrent_generations: Option<usize>,

    /// Generation attempts per fragment
    pub max_attempts: u32,

    /// Candidates requested per attempt
    pub candidates: u32,

    /// Temperature override
    pub temperature: Option<f32>,

    /// Stop once cumulative cost exceeds this many tokens
    pub budget: Option<u64>,

    /// Stop after this many emitted fragments (successful or failed)
    pub abort_after: Option<usize>,

    /// Stop after this much wall-clock time
    pub time_limit: Option<Duration>,

    /// Validation mode
    pub validation: ValidationMode,

    /// Regular expression for [`ValidationMode::Regex`]
    pub pattern: Option<String>,

    /// Choice among several acceptable candidates
    pub selection: SelectionPolicy,

    /// Handling of generator transport errors
    pub transport_errors: TransportErrorPolicy,

    /// System prompt sent with every fragment
    pub system_prompt: String,

    /// Character encoding of every input
    pub encoding: &'static Encoding,

    /// Token counter
    pub tokenizer: TokenizerKind,

    /// Record format of emitted outputs
    pub output_mode: OutputMode,

    /// Emit a marker for fragments that exhausted their attempts
    pub emit_failures: bool,
}

impl RunConfig {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use aigrep::{RunConfig, ValidationMode};
    ///
    /// let config = RunConfig::builder()
    ///     .chunk_size(512)
    ///     .validation(ValidationMode::Json)
    ///     .max_attempts(3)
    ///     .build()
    ///     .expect("valid configuration");
    /// ```
    #[must_use]
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Chunk size is zero or not larger than the overlap
    /// - A count or limit is zero
    /// - The validation mode and pattern do not combine
    pub fn validate(&self) -> Result<()> {
        if let Some(chunk_size) = self.chunk_size {
            if chunk_size == 0 {
                return Err(Error::config("chunk_size must be greater than 0"));
            }
            if self.chunk_overlap >= chunk_size {
                return Err(Error::config(format!(
                    "chunk_overlap ({}) must be less than chunk_size ({chunk_size})",
                    self.chunk_overlap
                )));
            }
        }

        if self.max_tokens == Some(0) {
            return Err(Error::config("max_tokens must be greater than 0"));
        }
        if self.parallelism == Some(0) {
            return Err(Error::config("parallelism must be at least 1"));
        }
        if self.max_concurrent_generations == Some(0) {
            return Err(Error::config(
                "max_concurrent_generations must be at least 1",
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("max_attempts must be at least 1"));
        }
        if self.candidates == 0 {
            return Err(Error::config("candidates must be at least 1"));
        }
        if self.budget == Some(0) {
            return Err(Error::config("budget must be greater than 0"));
        }
        if self.abort_after == Some(0) {
            return Err(Error::config("abort_after must be at least 1"));
        }
        if self.time_limit.is_some_and(|limit| limit.is_zero()) {
            return Err(Error::config("time_limit must be greater than 0"));
        }
        if self.system_prompt.trim().is_empty() {
            return Err(Error::config("system prompt must not be empty"));
        }

        // Resolving the validator checks the mode/pattern combination and
        // compiles the pattern.
        crate::validate::Validator::from_config(self.validation, self.pattern.as_deref())?;

        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            chunk_overlap: 0,
            max_tokens: None,
            parallelism: None,
            max_concurrent_generations: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            candidates: DEFAULT_CANDIDATES,
            temperature: None,
            budget: None,
            abort_after: None,
            time_limit: None,
            validation: ValidationMode::None,
            pattern: None,
            selection: SelectionPolicy::First,
            transport_errors: TransportErrorPolicy::Retry,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            encoding: encoding_rs::UTF_8,
            tokenizer: TokenizerKind::default(),
            output_mode: OutputMode::Text,
            emit_failures: false,
        }
    }
}

/// Builder for creating a [`RunConfig`].
#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
    max_tokens: Option<usize>,
    parallelism: Option<usize>,
    max_concurrent_generations: Option<usize>,
    max_attempts: Option<u32>,
    candidates: Option<u32>,
    temperature: Option<f32>,
    budget: Option<u64>,
    abort_after: Option<usize>,
    time_limit: Option<Duration>,
    validation: Option<ValidationMode>,
    pattern: Option<String>,
    selection: Option<SelectionPolicy>,
    transport_errors: Option<TransportErrorPolicy>,
    system_prompt: Option<String>,
    encoding: Option<&'static Encoding>,
    tokenizer: Option<TokenizerKind>,
    output_mode: Option<OutputMode>,
    emit_failures: bool,
}

impl RunConfigBuilder {
    /// Sets the chunk size in tokens.
    #[must_use]
    pub fn chunk_size(mut self, tokens: usize) -> Self {
        self.chunk_size = Some(tokens);
        self
    }

    /// Sets the overlap between consecutive chunks in tokens.
    #[must_use]
    pub fn chunk_overlap(mut self, tokens: usize) -> Self {
        self.chunk_overlap = Some(tokens);
        self
    }

    /// Sets the maximum number of tokens to generate per candidate.
    #[must_use]
    pub fn max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Sets the number of workers, overriding the model configuration.
    #[must_use]
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = Some(workers);
        self
    }

    /// Caps simultaneous generator calls independently of the worker count.
    #[must_use]
    pub fn max_concurrent_generations(mut self, limit: usize) -> Self {
        self.max_concurrent_generations = Some(limit);
        self
    }

    /// Sets the number of generation attempts per fragment.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the number of candidates requested per attempt.
    #[must_use]
    pub fn candidates(mut self, n: u32) -> Self {
        self.candidates = Some(n);
        self
    }

    /// Overrides the model's sampling temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the total token budget.
    #[must_use]
    pub fn budget(mut self, tokens: u64) -> Self {
        self.budget = Some(tokens);
        self
    }

    /// Stops the run after this many emitted fragments.
    #[must_use]
    pub fn abort_after(mut self, outputs: usize) -> Self {
        self.abort_after = Some(outputs);
        self
    }

    /// Stops the run after this much time.
    #[must_use]
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Sets the validation mode.
    #[must_use]
    pub fn validation(mut self, mode: ValidationMode) -> Self {
        self.validation = Some(mode);
        self
    }

    /// Sets the regular expression generated text must start with.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Sets the candidate selection policy.
    #[must_use]
    pub fn selection(mut self, policy: SelectionPolicy) -> Self {
        self.selection = Some(policy);
        self
    }

    /// Sets how transport errors from the generator are handled.
    #[must_use]
    pub fn transport_errors(mut self, policy: TransportErrorPolicy) -> Self {
        self.transport_errors = Some(policy);
        self
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the character encoding of the inputs.
    #[must_use]
    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Sets the tokenizer implementation.
    #[must_use]
    pub fn tokenizer(mut self, kind: TokenizerKind) -> Self {
        self.tokenizer = Some(kind);
        self
    }

    /// Sets the output record format.
    #[must_use]
    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = Some(mode);
        self
    }

    /// Enables failure markers in the output.
    #[must_use]
    pub fn emit_failures(mut self, enabled: bool) -> Self {
        self.emit_failures = enabled;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<RunConfig> {
        let defaults = RunConfig::default();
        let config = RunConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap.unwrap_or(defaults.chunk_overlap),
            max_tokens: self.max_tokens,
            parallelism: self.parallelism,
            max_concurrent_generations: self.max_concurrent_generations,
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            candidates: self.candidates.unwrap_or(defaults.candidates),
            temperature: self.temperature,
            budget: self.budget,
            abort_after: self.abort_after,
            time_limit: self.time_limit,
            validation: self.validation.unwrap_or(defaults.validation),
            pattern: self.pattern,
            selection: self.selection.unwrap_or(defaults.selection),
            transport_errors: self.transport_errors.unwrap_or(defaults.transport_errors),
            system_prompt: self.system_prompt.unwrap_or(defaults.system_prompt),
            encoding: self.encoding.unwrap_or(defaults.encoding),
            tokenizer: self.tokenizer.unwrap_or(defaults.tokenizer),
            output_mode: self.output_mode.unwrap_or(defaults.output_mode),
            emit_failures: self.emit_failures,
        };

        config.validate()?;
        Ok(config)
    }
}
