//! # aigrep
//!
//! Runs every chunk of a text corpus through a language model, in parallel,
//! and prints the validated outputs in input order.
//!
//! ## Features
//!
//! - Token-bounded chunking of files and standard input, with optional overlap
//! - Input in any WHATWG encoding (UTF-8 by default)
//! - Bounded concurrency with backpressure from the reader to the workers
//! - Output validation (regex, JSON, YAML, TOML) with retries
//! - Strict input-order output regardless of generation latency
//! - Cost budget, output count and run-time limits
//! - Text or JSONL output, to standard output or atomically to a file
//!
//! ## Quick Start
//!
//! ```no_run
//! use aigrep::{
//!     Pipeline, RunConfig, ScanOptions, Scanner, Settings, ValidationMode, VllmGenerator,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = Settings::load_or_builtin(&Settings::default_path())?;
//! let model = settings.model(None)?;
//!
//! let config = RunConfig::builder()
//!     .validation(ValidationMode::Json)
//!     .max_attempts(3)
//!     .build()?;
//! let generator = Arc::new(VllmGenerator::new(model, config.tokenizer.create()?)?);
//!
//! let files = Scanner::new(ScanOptions {
//!     recursive: true,
//!     ..ScanOptions::default()
//! })?
//! .scan(&["./docs"])?;
//!
//! let ok = Pipeline::new(config, model, generator)?
//!     .process(&files)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! 1. **Scanner**: turns paths, directories and globs into a sorted file list
//! 2. **Chunker**: splits each file into fragments of at most `chunk_size` tokens
//! 3. **Workers**: generate, validate and retry each fragment
//! 4. **Printer**: restores input order and emits

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod chunker;
mod config;
mod decode;
mod emit;
mod error;
mod file;
mod fragment;
mod generator;
mod pipeline;
mod prompt;
mod queue;
mod reorder;
mod scanner;
mod settings;
mod state;
mod token;
mod validate;

pub use chunker::{Chunker, TextChunk};
pub use config::{DEFAULT_SYSTEM_PROMPT, RunConfig, RunConfigBuilder, TransportErrorPolicy};
pub use decode::encoding_for_label;
pub use emit::{Emitter, FileEmitter, LineEmitter, OutputMode};
pub use error::{Error, Result};
pub use fragment::Fragment;
pub use generator::{Candidate, DryRunGenerator, Generator, SamplingParams, VllmGenerator, self_test};
pub use pipeline::{Pipeline, RunReport};
pub use prompt::{PromptTemplate, builtin_models};
pub use scanner::{STDIN_PATH, ScanOptions, Scanner, normalize_path};
pub use settings::{ModelConfig, Settings};
pub use state::StopReason;
pub use token::{TokenEstimator, TokenizerKind};
pub use validate::{
    SelectionPolicy, StructuredFormat, ValidationMode, Validator, Verdict, extract_code_block,
};
