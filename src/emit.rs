use crate::{
    error::{Error, Result},
    fragment::Fragment,
};
use serde::Serialize;
use std::{
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

const STDOUT_NAME: &str = "<stdout>";
const MARKER_PREFIX: &str = "#AIGREP:";

/// Output record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Raw accepted outputs, one per fragment
    #[default]
    Text,
    /// One JSON object per line with the fragment metadata
    Json,
}

/// Destination of emitted fragments, called in sequence order.
///
/// The pipeline drives an emitter from a blocking thread, so implementations
/// may write and flush synchronously.
pub trait Emitter: Send {
    /// Writes one fragment.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the sink cannot be written.
    fn emit(&mut self, fragment: &Fragment) -> Result<()>;

    /// Flushes and finalizes the sink. Called once, after the last emission.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the sink cannot be flushed.
    fn finish(&mut self) -> Result<()>;
}

#[derive(Serialize)]
struct Record<'a> {
    event: &'static str,
    #[serde(flatten)]
    fragment: &'a Fragment,
}

/// Failure marker: provenance only, the input text is left out.
#[derive(Serialize)]
struct Marker<'a> {
    event: &'static str,
    index: usize,
    path: &'a str,
    lineno: usize,
    lines: usize,
    attempt: u32,
}

impl<'a> Marker<'a> {
    fn failed(fragment: &'a Fragment) -> Self {
        Self {
            event: "FAILED",
            index: fragment.sequence_index,
            path: &fragment.source_path,
            lineno: fragment.start_line,
            lines: fragment.line_count,
            attempt: fragment.attempt,
        }
    }
}

/// Writes one line (or record) per fragment to any [`Write`].
pub struct LineEmitter<W> {
    out: W,
    target: PathBuf,
    mode: OutputMode,
    emit_failures: bool,
}

impl LineEmitter<io::Stdout> {
    /// Emitter writing to standard output.
    #[must_use]
    pub fn stdout(mode: OutputMode, emit_failures: bool) -> Self {
        Self::new(io::stdout(), STDOUT_NAME, mode, emit_failures)
    }
}

impl<W: Write + Send> LineEmitter<W> {
    /// Wraps `out`; `target` names it in error messages.
    pub fn new(out: W, target: impl Into<PathBuf>, mode: OutputMode, emit_failures: bool) -> Self {
        Self {
            out,
            target: target.into(),
            mode,
            emit_failures,
        }
    }

    /// Consumes the emitter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{line}")
            .and_then(|()| self.out.flush())
            .map_err(|e| Error::io(&self.target, e))
    }
}

impl<W: Write + Send> Emitter for LineEmitter<W> {
    fn emit(&mut self, fragment: &Fragment) -> Result<()> {
        match (self.mode, fragment.successful) {
            (OutputMode::Text, true) => self.write_line(&fragment.output_text),
            (OutputMode::Json, true) => {
                let line = serde_json::to_string(&Record {
                    event: "OUTPUT",
                    fragment,
                })?;
                self.write_line(&line)
            }
            (_, false) if !self.emit_failures => Ok(()),
            (OutputMode::Text, false) => {
                let line = serde_json::to_string(&Marker::failed(fragment))?;
                self.write_line(&format!("{MARKER_PREFIX}{line}"))
            }
            (OutputMode::Json, false) => {
                let line = serde_json::to_string(&Record {
                    event: "FAILED",
                    fragment,
                })?;
                self.write_line(&line)
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush().map_err(|e| Error::io(&self.target, e))
    }
}

/// Writes to a temporary file next to `path` and moves it into place on
/// [`Emitter::finish`]. An existing file at `path` is kept as a timestamped
/// backup.
pub struct FileEmitter {
    lines: LineEmitter<BufWriter<fs::File>>,
    temp_path: PathBuf,
    path: PathBuf,
}

impl FileEmitter {
    /// Creates the temporary output file, and parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be created.
    pub fn create(path: impl Into<PathBuf>, mode: OutputMode, emit_failures: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let temp_path = path.with_extension("tmp");
        let file = fs::File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;

        Ok(Self {
            lines: LineEmitter::new(BufWriter::new(file), &temp_path, mode, emit_failures),
            temp_path,
            path,
        })
    }

    fn backup(path: &Path) -> Result<()> {
        let filename = path
            .file_name()
            .ok_or_else(|| Error::config("Invalid output path"))?
            .to_string_lossy();
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S%f");
        let backup_path = path.with_file_name(format!("{filename}.backup.{timestamp}"));

        fs::copy(path, &backup_path).map_err(|e| Error::io(&backup_path, e))?;

        debug!("Created backup: {}", backup_path.display());
        Ok(())
    }
}

impl Emitter for FileEmitter {
    fn emit(&mut self, fragment: &Fragment) -> Result<()> {
        self.lines.emit(fragment)
    }

    fn finish(&mut self) -> Result<()> {
        self.lines.finish()?;
        self.lines
            .out
            .get_ref()
            .sync_all()
            .map_err(|e| Error::io(&self.temp_path, e))?;

        if self.path.exists() {
            Self::backup(&self.path)?;
        }

        fs::rename(&self.temp_path, &self.path).map_err(|e| Error::io(&self.path, e))?;
        debug!("Wrote outputs to {}", self.path.display());
        Ok(())
    }
}
