use aigrep::{
    DEFAULT_SYSTEM_PROMPT, DryRunGenerator, FileEmitter, Generator, OutputMode, Pipeline,
    RunConfig, STDIN_PATH, ScanOptions, Scanner, SelectionPolicy, Settings, TokenizerKind,
    TransportErrorPolicy, ValidationMode, VllmGenerator, encoding_for_label, self_test,
};
use anyhow::Context;
use clap::Parser;
use encoding_rs::Encoding;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "aigrep",
    version,
    author,
    disable_version_flag = true,
    about = "Process text with a language model, chunk by chunk",
    long_about = "Splits files (or standard input) into token-bounded chunks, runs each chunk \
    through a language model in parallel, validates the outputs and prints them in input \
    order.\n\n\
    USAGE EXAMPLES:\n  \
      # Summarize every file in a folder\n  \
      aigrep ./docs\n\n  \
      # Extract JSON from markdown files, retrying invalid outputs\n  \
      aigrep -r -s 'List the people mentioned as a JSON array' -V json -a 3 './notes/*.md'\n\n  \
      # Try the setup without calling the model\n  \
      cat README.md | aigrep -y -J"
)]
struct Cli {
    /// Print version
    #[arg(long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Verbose output (-vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Configuration")]
    verbose: u8,

    /// Path to the settings file [default: ~/.aigrep/config.toml]
    #[arg(short, long, value_name = "FILE", help_heading = "Configuration")]
    config: Option<PathBuf>,

    /// List all configured models and exit
    #[arg(short, long, help_heading = "Configuration")]
    info: bool,

    /// Write the default settings and exit (does not overwrite)
    #[arg(short = 'W', long, help_heading = "Configuration")]
    write: bool,

    /// Produce only machine parseable JSONL output
    #[arg(short = 'J', long, help_heading = "Configuration")]
    json: bool,

    /// Write outputs to this file instead of standard output
    #[arg(short, long, value_name = "FILE", help_heading = "Configuration")]
    output: Option<PathBuf>,

    /// Also emit a record for every fragment that failed
    #[arg(long, help_heading = "Configuration")]
    emit_failures: bool,

    /// ID of the model to use (defaults to the first one configured)
    #[arg(short, long, help_heading = "Language model")]
    model: Option<String>,

    /// Test model access and exit
    #[arg(short, long, help_heading = "Language model")]
    test: bool,

    /// Dry run (do not use the model, produce placeholder results)
    #[arg(short = 'y', long, help_heading = "Language model")]
    dry: bool,

    /// Maximum tokens to use in total
    #[arg(short = 'B', long, help_heading = "Language model")]
    budget: Option<u64>,

    /// Abort after producing this many outputs
    #[arg(short = 'A', long, help_heading = "Language model")]
    abort: Option<usize>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECONDS", help_heading = "Language model")]
    time_limit: Option<f64>,

    /// Number of parallel workers (overrides model settings)
    #[arg(short = 'P', long, help_heading = "Language model")]
    parallel: Option<usize>,

    /// Maximum number of generations in flight (defaults to --parallel)
    #[arg(long, help_heading = "Language model")]
    concurrency: Option<usize>,

    /// What to do when the model cannot be reached
    #[arg(long, value_enum, default_value = "retry", help_heading = "Language model")]
    on_transport_error: CliTransportPolicy,

    /// System prompt (the default one summarizes the text)
    #[arg(short, long, help_heading = "Prompt and generation")]
    system: Option<String>,

    /// Load the system prompt from a file
    #[arg(short = 'S', long, value_name = "FILE", help_heading = "Prompt and generation")]
    system_file: Option<PathBuf>,

    /// Context window size (overrides model settings)
    #[arg(short, long, help_heading = "Prompt and generation")]
    window: Option<usize>,

    /// Maximum tokens to generate (overrides calculated default)
    #[arg(short = 'M', long, help_heading = "Prompt and generation")]
    max_tokens: Option<usize>,

    /// Temperature (overrides model settings)
    #[arg(short = 'T', long, help_heading = "Prompt and generation")]
    temperature: Option<f32>,

    /// Tokenizer used to count tokens
    #[arg(long, value_enum, default_value = "tiktoken", help_heading = "Prompt and generation")]
    tokenizer: CliTokenizer,

    /// Validate the model output: json, yaml or toml
    #[arg(short = 'V', long, value_name = "FORMAT", help_heading = "Validation and retries")]
    validate: Option<ValidationMode>,

    /// Regular expression the output must start with
    #[arg(short = 'e', long, help_heading = "Validation and retries")]
    regexp: Option<String>,

    /// Maximum number of generation attempts per chunk
    #[arg(short, long, default_value_t = 1, help_heading = "Validation and retries")]
    attempts: u32,

    /// Number of generations per attempt (useful with --regexp)
    #[arg(short, long, default_value_t = 1, help_heading = "Validation and retries")]
    number: u32,

    /// Which valid generation to keep
    #[arg(long, value_enum, default_value = "first", help_heading = "Validation and retries")]
    select: CliSelect,

    /// Chunk size in tokens (default is a third of the context size)
    #[arg(short = 'k', long, help_heading = "Reading and chunking text")]
    chunk: Option<usize>,

    /// Chunk overlap in tokens (approximate)
    #[arg(short = 'l', long, default_value_t = 0, help_heading = "Reading and chunking text")]
    overlap: usize,

    /// Character encoding of all the inputs (WHATWG label, e.g. latin1, utf-16le)
    #[arg(
        short = 'E',
        long,
        default_value = "utf-8",
        value_parser = encoding_for_label,
        help_heading = "Reading and chunking text"
    )]
    encoding: &'static Encoding,

    /// Recursive directory traversal
    #[arg(short, long, help_heading = "Filesystem traversal")]
    recursive: bool,

    /// Follow symbolic links
    #[arg(short = 'L', long, help_heading = "Filesystem traversal")]
    follow: bool,

    /// Exclude files matching any of these glob patterns
    #[arg(short = 'X', long, num_args = 1.., help_heading = "Filesystem traversal")]
    exclude: Vec<String>,

    /// Process files that look binary too
    #[arg(long, help_heading = "Filesystem traversal")]
    include_binary: bool,

    /// Files or folders to process, may contain glob patterns (stdin if none given)
    #[arg(value_name = "PATHS")]
    paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliTokenizer {
    Simple,
    Enhanced,
    Tiktoken,
}

impl From<CliTokenizer> for TokenizerKind {
    fn from(t: CliTokenizer) -> Self {
        match t {
            CliTokenizer::Simple => Self::Simple,
            CliTokenizer::Enhanced => Self::Enhanced,
            CliTokenizer::Tiktoken => Self::Tiktoken,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliSelect {
    /// First valid generation, in the order returned
    First,
    /// Shortest valid generation
    Shortest,
}

impl From<CliSelect> for SelectionPolicy {
    fn from(s: CliSelect) -> Self {
        match s {
            CliSelect::First => Self::First,
            CliSelect::Shortest => Self::Shortest,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliTransportPolicy {
    /// Count the error as a failed attempt
    Retry,
    /// Stop the run
    Abort,
}

impl From<CliTransportPolicy> for TransportErrorPolicy {
    fn from(p: CliTransportPolicy) -> Self {
        match p {
            CliTransportPolicy::Retry => Self::Retry,
            CliTransportPolicy::Abort => Self::Abort,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose)?;

    let settings_path = cli.config.clone().unwrap_or_else(Settings::default_path);
    let settings = Settings::load_or_builtin(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    if cli.info {
        for model in &settings.models {
            println!("{}", model.id);
        }
        return Ok(ExitCode::SUCCESS);
    }

    if cli.write {
        if settings_path.exists() {
            println!("Already exists: {}", settings_path.display());
        } else {
            Settings::builtin()
                .save(&settings_path)
                .context("Failed to write settings")?;
            println!("Wrote: {}", settings_path.display());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut model = settings.model(cli.model.as_deref())?.clone();
    if let Some(window) = cli.window {
        model.context = window;
    }
    if let Some(parallel) = cli.parallel {
        model.parallel = parallel;
    }
    if let Some(temperature) = cli.temperature {
        model.temperature = temperature;
    }

    let tokenizer = TokenizerKind::from(cli.tokenizer);
    let generator: Arc<dyn Generator> = if cli.dry {
        Arc::new(DryRunGenerator)
    } else {
        Arc::new(
            VllmGenerator::new(&model, tokenizer.create()?)
                .context("Failed to create generation client")?,
        )
    };

    if cli.test {
        let passed = self_test(
            generator.as_ref(),
            &model.sampling_params(),
            tokenizer.create()?.as_ref(),
        )
        .await
        .context("Model test failed")?;

        println!("{}", if passed { "OK" } else { "FAILED" });
        return Ok(if passed {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let system_prompt = match &cli.system_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read system prompt from {}", path.display()))?
            .trim()
            .to_string(),
        None => cli
            .system
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    };

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let validation = match (cli.validate, &cli.regexp) {
        (Some(mode), _) => mode,
        (None, Some(_)) => ValidationMode::Regex,
        (None, None) => ValidationMode::None,
    };

    let mut builder = RunConfig::builder()
        .chunk_overlap(cli.overlap)
        .encoding(cli.encoding)
        .max_attempts(cli.attempts)
        .candidates(cli.number)
        .validation(validation)
        .selection(cli.select.into())
        .transport_errors(cli.on_transport_error.into())
        .system_prompt(system_prompt)
        .tokenizer(tokenizer)
        .output_mode(output_mode)
        .emit_failures(cli.emit_failures);

    if let Some(chunk) = cli.chunk {
        builder = builder.chunk_size(chunk);
    }
    if let Some(max_tokens) = cli.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }
    if let Some(concurrency) = cli.concurrency {
        builder = builder.max_concurrent_generations(concurrency);
    }
    if let Some(budget) = cli.budget {
        builder = builder.budget(budget);
    }
    if let Some(abort) = cli.abort {
        builder = builder.abort_after(abort);
    }
    if let Some(seconds) = cli.time_limit {
        let limit = Duration::try_from_secs_f64(seconds)
            .with_context(|| format!("Invalid time limit: {seconds}"))?;
        builder = builder.time_limit(limit);
    }
    if let Some(regexp) = &cli.regexp {
        builder = builder.pattern(regexp);
    }

    let config = builder.build().context("Failed to build configuration")?;

    let scanner = Scanner::new(ScanOptions {
        recursive: cli.recursive,
        follow_links: cli.follow,
        exclude: cli.exclude.clone(),
        include_binary: cli.include_binary,
    })?;
    let paths = if cli.paths.is_empty() {
        vec![STDIN_PATH.to_string()]
    } else {
        cli.paths.clone()
    };
    let files = scanner.scan(&paths).context("Failed to enumerate input files")?;

    let mut pipeline =
        Pipeline::new(config, &model, generator).context("Failed to create pipeline")?;
    if let Some(output) = &cli.output {
        pipeline = pipeline.with_emitter(Box::new(
            FileEmitter::create(output, output_mode, cli.emit_failures)
                .context("Failed to create output file")?,
        ));
    }

    let report = pipeline
        .run(&files)
        .await
        .context("Pipeline execution failed")?;
    report.log_summary();

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("aigrep=info"),
        1 => EnvFilter::new("aigrep=debug"),
        _ => EnvFilter::new("aigrep=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false),
        )
        .init();

    Ok(())
}
