use crate::chunker::TextChunk;
use serde::Serialize;

/// The unit of work flowing through the pipeline.
///
/// A fragment is owned by exactly one stage at a time: the reader creates it,
/// a single worker mutates it (possibly several times, when retried), and the
/// printer consumes it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Fragment {
    /// Global position in input order, contiguous from 0 for a run
    #[serde(rename = "index")]
    pub sequence_index: usize,

    /// Input path (`-` for standard input)
    #[serde(rename = "path")]
    pub source_path: String,

    /// 1-based line number where the fragment starts
    #[serde(rename = "lineno")]
    pub start_line: usize,

    /// Number of input lines the fragment spans
    #[serde(rename = "lines")]
    pub line_count: usize,

    /// Text submitted to the generator
    #[serde(rename = "input")]
    pub input_text: String,

    /// Accepted generation, empty unless `successful`
    #[serde(rename = "output")]
    pub output_text: String,

    /// Generation attempts made so far
    pub attempt: u32,

    /// Whether a validated output was accepted
    pub successful: bool,
}

impl Fragment {
    /// Wraps a chunk read from `source_path`.
    #[must_use]
    pub fn new(sequence_index: usize, source_path: impl Into<String>, chunk: TextChunk) -> Self {
        Self {
            sequence_index,
            source_path: source_path.into(),
            start_line: chunk.start_line,
            line_count: chunk.line_count,
            input_text: chunk.text,
            output_text: String::new(),
            attempt: 0,
            successful: false,
        }
    }

    /// Records an accepted output.
    pub fn accept(&mut self, output: String) {
        self.output_text = output;
        self.successful = true;
    }

    /// Marks the fragment as terminally failed.
    pub fn reject(&mut self) {
        self.output_text.clear();
        self.successful = false;
    }
}
