use crate::{
    error::{Error, Result},
    token::TokenEstimator,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// A token-bounded slice of one input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// 1-based line number of the first line in `text`
    pub start_line: usize,

    /// Number of input lines the chunk spans
    pub line_count: usize,

    /// The chunk text, line endings preserved
    pub text: String,
}

/// One buffered input line and its token count.
#[derive(Debug)]
struct Line {
    text: String,
    tokens: usize,
}

/// Splits a line-oriented stream into token-bounded chunks.
///
/// Lines are pushed one at a time; [`Chunker::push`] returns a finished chunk
/// whenever the next line would bring the buffer to `chunk_size` tokens.
/// The caller drives reading, which lets the pipeline apply backpressure
/// between chunks of the same file.
///
/// Every emitted chunk holds at most `chunk_size` tokens as counted line by
/// line. With `chunk_overlap > 0` consecutive chunks share a trailing run of
/// whole lines worth at most `chunk_overlap` tokens.
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    tokenizer: Arc<dyn TokenEstimator>,
    lines: VecDeque<Line>,
    tokens: usize,
    line_number: usize,
}

impl Chunker {
    /// Creates a chunker for a single input stream.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `0 <= chunk_overlap < chunk_size`.
    pub fn new(
        chunk_size: usize,
        chunk_overlap: usize,
        tokenizer: Arc<dyn TokenEstimator>,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::config("chunk size must be greater than 0"));
        }
        if chunk_overlap >= chunk_size {
            return Err(Error::config(format!(
                "chunk overlap ({chunk_overlap}) must be less than chunk size ({chunk_size})"
            )));
        }

        Ok(Self {
            chunk_size,
            chunk_overlap,
            tokenizer,
            lines: VecDeque::new(),
            tokens: 0,
            line_number: 1,
        })
    }

    /// Feeds the next line (including its line terminator, if any).
    ///
    /// Returns the chunk completed by this line, if one was completed and it
    /// contains more than whitespace.
    pub fn push(&mut self, line: &str) -> Option<TextChunk> {
        let mut line = line.to_owned();
        let mut line_tokens = self.tokenizer.estimate(&line);

        if self.tokens + line_tokens < self.chunk_size {
            self.append(line, line_tokens);
            return None;
        }

        if line_tokens >= self.chunk_size {
            (line, line_tokens) = self.truncate(&line, line_tokens);
        }

        let chunk = self.current_chunk();

        if self.chunk_overlap > 0 {
            // Keep a suffix worth at most `chunk_overlap` tokens that still
            // leaves room for the incoming line.
            while let Some(front) = self.lines.front() {
                if self.tokens <= self.chunk_overlap
                    && self.tokens + line_tokens <= self.chunk_size
                {
                    break;
                }
                self.tokens -= front.tokens;
                self.line_number += 1;
                self.lines.pop_front();
            }
        } else {
            self.line_number += self.lines.len();
            self.lines.clear();
            self.tokens = 0;
        }

        self.append(line, line_tokens);
        chunk
    }

    /// Flushes whatever is left in the buffer at end of stream.
    #[must_use]
    pub fn finish(self) -> Option<TextChunk> {
        self.current_chunk()
    }

    /// Splits a complete in-memory text.
    #[must_use]
    pub fn split(mut self, text: &str) -> Vec<TextChunk> {
        let mut chunks: Vec<TextChunk> = text
            .split_inclusive('\n')
            .filter_map(|line| self.push(line))
            .collect();
        chunks.extend(self.finish());
        chunks
    }

    fn append(&mut self, text: String, tokens: usize) {
        self.tokens += tokens;
        self.lines.push_back(Line { text, tokens });
    }

    /// Builds a chunk from the current buffer without consuming it.
    fn current_chunk(&self) -> Option<TextChunk> {
        let text: String = self.lines.iter().map(|l| l.text.as_str()).collect();
        if text.trim().is_empty() {
            return None;
        }

        Some(TextChunk {
            start_line: self.line_number,
            line_count: self.lines.len(),
            text,
        })
    }

    /// Cuts a pathologically long line down to at most `chunk_size` tokens.
    ///
    /// Starts from a cut proportional to the overshoot, then shrinks by 5%
    /// steps. The kept prefix strictly shrinks on every step, so this always
    /// terminates.
    fn truncate(&self, line: &str, tokens: usize) -> (String, usize) {
        let total_chars = line.chars().count();
        let mut keep = total_chars.saturating_mul(self.chunk_size) / tokens.max(1);
        let mut text = char_prefix(line, keep).to_owned();
        let mut count = self.tokenizer.estimate(&text);

        while keep > 0 && count > self.chunk_size {
            keep = keep * 95 / 100;
            text = char_prefix(line, keep).to_owned();
            count = self.tokenizer.estimate(&text);
        }

        trace!(
            line = self.line_number + self.lines.len(),
            from_tokens = tokens,
            to_tokens = count,
            "Truncated long line"
        );

        (text, count)
    }
}

/// Returns the first `n` characters of `s`.
fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
