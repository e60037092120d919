use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

const SIMPLE_CHARS_PER_TOKEN: usize = 4;
const ENHANCED_WORD_MULTIPLIER: f64 = 1.3;
const ENHANCED_SPECIAL_DIVISOR: usize = 10;

static CL100K: Lazy<std::result::Result<Arc<CoreBPE>, String>> =
    Lazy::new(|| tiktoken_rs::cl100k_base().map(Arc::new).map_err(|e| e.to_string()));

/// Type of tokenizer used to count tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenizerKind {
    /// Simple character-based tokenizer (~4 chars per token)
    Simple,
    /// Enhanced tokenizer with word and special character analysis
    Enhanced,
    /// BPE tokenizer (`cl100k_base`), a close approximation for most chat models
    #[default]
    Tiktoken,
}

impl TokenizerKind {
    /// Creates a new tokenizer instance of this kind.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the BPE tables cannot be loaded.
    pub fn create(self) -> Result<Arc<dyn TokenEstimator>> {
        Ok(match self {
            Self::Simple => Arc::new(SimpleTokenizer),
            Self::Enhanced => Arc::new(EnhancedTokenizer),
            Self::Tiktoken => Arc::new(TiktokenTokenizer::new()?),
        })
    }
}

/// Deterministic token-count oracle.
///
/// Implementations must be thread-safe and must return 0 for
/// whitespace-only input.
pub trait TokenEstimator: Send + Sync {
    /// Estimates the number of tokens in the given text.
    fn estimate(&self, text: &str) -> usize;
}

/// Simple character-based tokenizer.
///
/// Uses a heuristic of approximately 4 characters per token,
/// which works reasonably well for source code.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SimpleTokenizer;

impl TokenEstimator for SimpleTokenizer {
    fn estimate(&self, text: &str) -> usize {
        if is_blank(text) {
            return 0;
        }

        let char_count = text.chars().count();
        char_count
            .saturating_add(SIMPLE_CHARS_PER_TOKEN - 1)
            .saturating_div(SIMPLE_CHARS_PER_TOKEN)
            .max(1)
    }
}

/// Enhanced tokenizer with multiple heuristics.
///
/// This tokenizer considers:
/// - Word count (weighted by 1.3)
/// - Character count (divided by 4)
/// - Special characters (penalty factor)
#[derive(Debug, Clone, Copy)]
pub(crate) struct EnhancedTokenizer;

impl TokenEstimator for EnhancedTokenizer {
    fn estimate(&self, text: &str) -> usize {
        if is_blank(text) {
            return 0;
        }

        let words = count_words(text);
        let chars = text.chars().count();
        let special_chars = count_special_chars(text);

        let word_estimate = (words as f64 * ENHANCED_WORD_MULTIPLIER) as usize;
        let char_estimate = chars.saturating_div(SIMPLE_CHARS_PER_TOKEN);
        let special_penalty = special_chars.saturating_div(ENHANCED_SPECIAL_DIVISOR);

        let base_estimate = word_estimate
            .saturating_add(char_estimate)
            .saturating_div(2);

        base_estimate.saturating_add(special_penalty).max(1)
    }
}

/// Byte-pair-encoding tokenizer backed by `tiktoken-rs`.
///
/// Special tokens are encoded as ordinary text, so arbitrary input never
/// fails to tokenize.
#[derive(Clone)]
pub(crate) struct TiktokenTokenizer {
    bpe: Arc<CoreBPE>,
}

impl TiktokenTokenizer {
    pub(crate) fn new() -> Result<Self> {
        let bpe = CL100K
            .as_ref()
            .map_err(|e| Error::config(format!("Failed to load tokenizer: {e}")))?;
        Ok(Self {
            bpe: Arc::clone(bpe),
        })
    }
}

impl TokenEstimator for TiktokenTokenizer {
    fn estimate(&self, text: &str) -> usize {
        if is_blank(text) {
            return 0;
        }
        self.bpe.encode_ordinary(text).len()
    }
}

#[inline]
fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Counts words in text (whitespace-separated).
#[inline]
fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Counts special (non-alphanumeric) characters.
#[inline]
fn count_special_chars(text: &str) -> usize {
    text.chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count()
}
