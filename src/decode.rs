use crate::error::{Error, Result};
use encoding_rs::{Decoder, DecoderResult, Encoding};

/// Looks up an encoding by its WHATWG label (`utf-8`, `latin1`, `utf-16le`, ...).
///
/// # Errors
///
/// Returns a configuration error for an unknown label.
pub fn encoding_for_label(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| Error::config(format!("Unknown encoding: {label}")))
}

/// Decodes a byte stream block by block and hands out complete lines.
///
/// Malformed input is an error, never replaced. A byte order mark at the start
/// of the stream is dropped.
pub(crate) struct LineDecoder {
    decoder: Decoder,
    text: String,
    start: usize,
}

impl LineDecoder {
    pub(crate) fn new(encoding: &'static Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_with_bom_removal(),
            text: String::new(),
            start: 0,
        }
    }

    /// Decodes the next block; `last` marks the end of the stream.
    ///
    /// Returns `false` if the input is malformed for the encoding.
    pub(crate) fn feed(&mut self, mut bytes: &[u8], last: bool) -> bool {
        self.compact();

        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length_without_replacement(bytes.len())
                .unwrap_or(bytes.len().saturating_mul(3).saturating_add(16));
            self.text.reserve(needed);

            let (result, read) =
                self.decoder
                    .decode_to_string_without_replacement(bytes, &mut self.text, last);
            bytes = &bytes[read..];

            match result {
                DecoderResult::InputEmpty => return true,
                DecoderResult::OutputFull => {}
                DecoderResult::Malformed(..) => return false,
            }
        }
    }

    /// Next complete line, terminator included.
    pub(crate) fn next_line(&mut self) -> Option<String> {
        let end = self.start + self.text[self.start..].find('\n')? + 1;
        let line = self.text[self.start..end].to_owned();
        self.start = end;
        Some(line)
    }

    /// Unterminated text left once the stream has ended.
    pub(crate) fn take_rest(&mut self) -> Option<String> {
        self.compact();
        (!self.text.is_empty()).then(|| std::mem::take(&mut self.text))
    }

    fn compact(&mut self) {
        self.text.drain(..self.start);
        self.start = 0;
    }
}
