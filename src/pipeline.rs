//! The concurrent fragment pipeline.
//!
//! One reader task chunks the input files into fragments, a pool of worker
//! tasks generates and validates, and one printer task restores input order
//! and emits. The stages are connected by two bounded queues:
//!
//! ```text
//! paths ─▶ reader ─▶ WorkQueue ─▶ workers ─▶ output channel ─▶ printer ─▶ sink ─▶ Emitter
//!                       ▲            │
//!                       └─ retries ──┘
//! ```
//!
//! The emitter writes with blocking I/O, so the sink runs it on the blocking
//! thread pool and the printer only hands it fragments in order.
//!
//! Every stage selects on the run's cancellation token at its suspension
//! points. Generator calls already in flight are allowed to complete; their
//! results are discarded once the run is stopped.

use crate::{
    chunker::{Chunker, TextChunk},
    config::{RunConfig, TransportErrorPolicy},
    decode::LineDecoder,
    emit::{Emitter, LineEmitter},
    error::{Error, Result},
    fragment::Fragment,
    generator::{Generator, SamplingParams},
    prompt::PromptTemplate,
    queue::WorkQueue,
    reorder::ReorderBuffer,
    scanner::{STDIN_PATH, normalize_path},
    settings::ModelConfig,
    state::{RunState, StopReason},
    token::TokenEstimator,
    validate::{SelectionPolicy, Validator},
};
use chrono::{DateTime, Local};
use encoding_rs::Encoding;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// When the run started
    pub started_at: DateTime<Local>,

    /// Input files (or standard input) the reader managed to open
    pub files: usize,

    /// Fragments created by the reader
    pub fragments: usize,

    /// Fragments emitted, successful or failed
    pub emitted: usize,

    /// Fragments emitted with an accepted output
    pub succeeded: usize,

    /// Fragments that exhausted their attempts
    pub failed: usize,

    /// Generation attempts started
    pub attempts: usize,

    /// Cumulative cost of accepted attempts, in tokens
    pub cost: u64,

    /// Why the run stopped; `None` when there was nothing to run
    pub stop_reason: Option<StopReason>,

    /// Total execution time
    pub duration: Duration,
}

impl RunReport {
    fn empty(started_at: DateTime<Local>, duration: Duration) -> Self {
        Self {
            started_at,
            files: 0,
            fragments: 0,
            emitted: 0,
            succeeded: 0,
            failed: 0,
            attempts: 0,
            cost: 0,
            stop_reason: None,
            duration,
        }
    }

    fn from_state(state: &RunState, started_at: DateTime<Local>, duration: Duration) -> Self {
        Self {
            started_at,
            files: state.files_opened.load(Ordering::SeqCst),
            fragments: state.fragments_read.load(Ordering::SeqCst),
            emitted: state.emitted.load(Ordering::SeqCst),
            succeeded: state.succeeded.load(Ordering::SeqCst),
            failed: state.failures.load(Ordering::SeqCst),
            attempts: state.attempts.load(Ordering::SeqCst),
            cost: state.cost.load(Ordering::SeqCst),
            stop_reason: state.stop_reason(),
            duration,
        }
    }

    /// True iff at least one input could be opened and no fragment terminally
    /// failed.
    ///
    /// A run stopped early by a limit still succeeds.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.files > 0 && self.failed == 0
    }

    /// Logs a one-line summary at info level.
    pub fn log_summary(&self) {
        info!(
            files = self.files,
            fragments = self.fragments,
            emitted = self.emitted,
            succeeded = self.succeeded,
            failed = self.failed,
            attempts = self.attempts,
            cost = self.cost,
            stop_reason = ?self.stop_reason,
            "Run finished in {:.2}s",
            self.duration.as_secs_f64()
        );
    }
}

/// Everything the stages share, resolved once in [`Pipeline::new`].
struct Shared {
    generator: Arc<dyn Generator>,
    tokenizer: Arc<dyn TokenEstimator>,
    encoding: &'static Encoding,
    validator: Validator,
    params: SamplingParams,
    system_prompt: String,
    chunk_size: usize,
    chunk_overlap: usize,
    max_attempts: u32,
    budget: Option<u64>,
    abort_after: Option<usize>,
    transport_errors: TransportErrorPolicy,
    selection: SelectionPolicy,
    state: RunState,
}

/// Main processing pipeline.
///
/// # Examples
///
/// ```no_run
/// use aigrep::{DryRunGenerator, ModelConfig, Pipeline, RunConfig};
/// use std::sync::Arc;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let model = ModelConfig::new("meta-llama/Llama-2-7b-chat-hf");
/// let config = RunConfig::builder().chunk_size(512).build()?;
///
/// let report = Pipeline::new(config, &model, Arc::new(DryRunGenerator))?
///     .run(&["notes.txt"])
///     .await?;
/// report.log_summary();
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    shared: Shared,
    parallelism: usize,
    concurrency: usize,
    time_limit: Option<Duration>,
    emitter: Box<dyn Emitter>,
}

impl Pipeline {
    /// Creates a new pipeline for `model`, emitting to standard output.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if:
    /// - The model configuration is invalid or has no prompt template
    /// - The chunk size does not fit the context window next to the prompt
    /// - No room is left for generated tokens
    /// - The tokenizer or validator cannot be created
    pub fn new(config: RunConfig, model: &ModelConfig, generator: Arc<dyn Generator>) -> Result<Self> {
        config.validate()?;
        model.validate()?;

        let tokenizer = config.tokenizer.create()?;
        let validator = Validator::from_config(config.validation, config.pattern.as_deref())?;

        let template = PromptTemplate::for_model(&model.id, model.prompt_template.as_deref())?;
        let overhead = tokenizer.estimate(&template.render(&config.system_prompt, "")?);
        let available = model.context.saturating_sub(overhead);

        let chunk_size = config.chunk_size.unwrap_or(model.context / 3);
        if chunk_size == 0 || chunk_size > available {
            return Err(Error::config(format!(
                "Invalid chunk size: {chunk_size} (context {} tokens, prompt uses {overhead})",
                model.context
            )));
        }
        if config.chunk_overlap >= chunk_size {
            return Err(Error::config(format!(
                "Invalid chunk overlap: {} (chunk size {chunk_size})",
                config.chunk_overlap
            )));
        }

        let max_tokens = config.max_tokens.unwrap_or(available - chunk_size);
        if max_tokens == 0 {
            return Err(Error::config(format!("Invalid max tokens: {max_tokens}")));
        }

        let mut params = model.sampling_params();
        params.n = config.candidates;
        params.max_tokens = Some(max_tokens);
        if let Some(temperature) = config.temperature {
            params.temperature = temperature;
        }

        let parallelism = config.parallelism.unwrap_or(model.parallel).max(1);
        let concurrency = config.max_concurrent_generations.unwrap_or(parallelism);

        debug!(
            chunk_size,
            chunk_overlap = config.chunk_overlap,
            max_tokens,
            prompt_tokens = overhead,
            parallelism,
            concurrency,
            "Pipeline configured"
        );

        let emitter = Box::new(LineEmitter::stdout(config.output_mode, config.emit_failures));

        Ok(Self {
            shared: Shared {
                generator,
                tokenizer,
                encoding: config.encoding,
                validator,
                params,
                system_prompt: config.system_prompt,
                chunk_size,
                chunk_overlap: config.chunk_overlap,
                max_attempts: config.max_attempts,
                budget: config.budget,
                abort_after: config.abort_after,
                transport_errors: config.transport_errors,
                selection: config.selection,
                state: RunState::new(),
            },
            parallelism,
            concurrency,
            time_limit: config.time_limit,
            emitter,
        })
    }

    /// Replaces the output sink.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Box<dyn Emitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Effective chunk size in tokens.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    /// Sampling parameters sent with every generation.
    #[must_use]
    pub const fn sampling_params(&self) -> &SamplingParams {
        &self.shared.params
    }

    /// Processes `paths` (`-` is standard input) and reports how it went.
    ///
    /// Paths are normalized, de-duplicated and sorted; fragment indices follow
    /// that order. Stopping on a limit is not an error.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the run: a transport error under
    /// [`TransportErrorPolicy::Abort`], an emitter failure, or a task failure.
    #[instrument(skip_all, fields(parallelism = self.parallelism))]
    pub async fn run<S: AsRef<str>>(self, paths: &[S]) -> Result<RunReport> {
        let started_at = Local::now();
        let start = Instant::now();

        let paths: Vec<String> = paths
            .iter()
            .map(|p| {
                let p = p.as_ref();
                if p == STDIN_PATH {
                    p.to_string()
                } else {
                    normalize_path(Path::new(p))
                }
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if paths.is_empty() {
            warn!("No files found");
            return Ok(RunReport::empty(started_at, start.elapsed()));
        }
        debug!(count = paths.len(), ?paths, "Files found");

        let shared = Arc::new(self.shared);
        let input = WorkQueue::new(self.parallelism);
        let (output_tx, output_rx) = mpsc::channel(self.parallelism);
        let (sink_tx, sink_rx) = mpsc::channel(self.parallelism);
        let permits = Arc::new(Semaphore::new(self.concurrency));

        let mut tasks = JoinSet::new();
        tasks.spawn(read_paths(Arc::clone(&shared), paths, input.clone()));
        tasks.spawn(print(Arc::clone(&shared), output_rx, sink_tx));
        let emitter = self.emitter;
        tasks.spawn_blocking(move || write_outputs(sink_rx, emitter));
        for worker in 0..self.parallelism {
            tasks.spawn(generate(
                Arc::clone(&shared),
                worker,
                input.clone(),
                output_tx.clone(),
                Arc::clone(&permits),
            ));
        }
        if let Some(limit) = self.time_limit {
            tasks.spawn(watch_time(Arc::clone(&shared), limit));
        }
        drop(output_tx);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => shared.state.fail(e),
                Err(e) => shared.state.fail(e.into()),
            }
        }

        let state = &shared.state;
        if let Some(e) = state.take_fatal() {
            return Err(e);
        }

        let report = RunReport::from_state(state, started_at, start.elapsed());
        if report.failed > 0 {
            info!(count = report.failed, "Failed fragments");
        }
        Ok(report)
    }

    /// Runs the pipeline and returns the overall verdict: true iff some input
    /// could be read and every fragment produced a valid output.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::run`].
    pub async fn process<S: AsRef<str>>(self, paths: &[S]) -> Result<bool> {
        let report = self.run(paths).await?;
        report.log_summary();
        Ok(report.is_success())
    }
}

type Source = Box<dyn AsyncRead + Unpin + Send>;

const READ_BLOCK: usize = 64 * 1024;

async fn open(path: &str) -> std::io::Result<Source> {
    if path == STDIN_PATH {
        return Ok(Box::new(tokio::io::stdin()));
    }
    Ok(Box::new(tokio::fs::File::open(path).await?))
}

/// Reader stage: chunks every path in order and feeds the input queue.
async fn read_paths(shared: Arc<Shared>, paths: Vec<String>, input: WorkQueue) -> Result<()> {
    let state = &shared.state;
    let mut next_index = 0;

    for path in paths {
        if state.is_aborted() {
            return Ok(());
        }
        debug!(path = %path, "Reading file");

        let mut source = match open(&path).await {
            Ok(source) => source,
            Err(e) => {
                warn!("Skipping {}: {}", path, Error::io(&path, e));
                continue;
            }
        };
        state.file_opened();

        let mut chunker = Chunker::new(
            shared.chunk_size,
            shared.chunk_overlap,
            Arc::clone(&shared.tokenizer),
        )?;
        let mut decoder = LineDecoder::new(shared.encoding);
        let mut block = vec![0; READ_BLOCK];
        let mut complete = true;

        loop {
            let read = tokio::select! {
                biased;
                () = state.token().cancelled() => return Ok(()),
                read = source.read(&mut block) => read,
            };

            let read = match read {
                Ok(read) => read,
                Err(e) => {
                    warn!("Stopped reading {}: {}", path, Error::io(&path, e));
                    complete = false;
                    break;
                }
            };

            let last = read == 0;
            if !decoder.feed(&block[..read], last) {
                warn!("{}", Error::decode(&path, shared.encoding.name()));
                complete = false;
                break;
            }

            while let Some(line) = decoder
                .next_line()
                .or_else(|| if last { decoder.take_rest() } else { None })
            {
                if let Some(chunk) = chunker.push(&line)
                    && !submit(&shared, &input, &path, &mut next_index, chunk).await
                {
                    return Ok(());
                }
            }
            if last {
                break;
            }
        }

        if complete
            && let Some(chunk) = chunker.finish()
            && !submit(&shared, &input, &path, &mut next_index, chunk).await
        {
            return Ok(());
        }
    }

    debug!(fragments = next_index, "Finished reading");
    state.finish_reading();
    Ok(())
}

/// Wraps a chunk into the next fragment and queues it. Returns false if the
/// run stopped while waiting for room.
async fn submit(
    shared: &Shared,
    input: &WorkQueue,
    path: &str,
    next_index: &mut usize,
    chunk: TextChunk,
) -> bool {
    let state = &shared.state;
    if state.is_aborted() {
        return false;
    }

    let fragment = Fragment::new(*next_index, path, chunk);
    *next_index += 1;
    state.fragment_created();
    debug!(
        index = fragment.sequence_index,
        path,
        line = fragment.start_line,
        lines = fragment.line_count,
        "Fragment read"
    );

    tokio::select! {
        biased;
        () = state.token().cancelled() => false,
        pushed = input.push(fragment) => pushed && !state.is_aborted(),
    }
}

/// Worker stage: generate, validate, retry or hand over to the printer.
async fn generate(
    shared: Arc<Shared>,
    worker: usize,
    input: WorkQueue,
    output: mpsc::Sender<Fragment>,
    permits: Arc<Semaphore>,
) -> Result<()> {
    let state = &shared.state;
    let token = state.token();

    loop {
        let mut fragment = tokio::select! {
            biased;
            () = token.cancelled() => break,
            popped = input.pop() => match popped {
                Some(fragment) => fragment,
                None => break,
            },
        };

        fragment.attempt += 1;
        state.attempts.fetch_add(1, Ordering::Relaxed);

        let permit = tokio::select! {
            biased;
            () = token.cancelled() => break,
            permit = permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            worker,
            index = fragment.sequence_index,
            attempt = fragment.attempt,
            in_flight,
            "Generating"
        );
        let result = shared
            .generator
            .generate(&shared.system_prompt, &fragment.input_text, &shared.params)
            .await;
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        let candidates = match result {
            Ok(candidates) => candidates,
            Err(e) if shared.transport_errors == TransportErrorPolicy::Abort => {
                state.fail(e);
                break;
            }
            Err(e) => {
                warn!(index = fragment.sequence_index, attempt = fragment.attempt, "{e}");
                Vec::new()
            }
        };

        let cost: u64 = candidates.iter().map(|c| c.cost).sum();

        match shared.validator.select(&candidates, shared.selection) {
            Some(text) => {
                fragment.accept(text);
                debug!(
                    index = fragment.sequence_index,
                    attempt = fragment.attempt,
                    cost,
                    "Generation accepted"
                );
                // Paid for even if the run stops before the printer takes it.
                let total = state.add_cost(cost);
                let handed_over = hand_over(state, &output, fragment).await;

                if let Some(budget) = shared.budget
                    && total > budget
                {
                    info!(cost = total, budget, "Over budget");
                    state.stop(StopReason::Budget);
                }
                if !handed_over {
                    break;
                }
            }
            None if fragment.attempt < shared.max_attempts => {
                debug!(
                    index = fragment.sequence_index,
                    attempt = fragment.attempt,
                    "Retrying generation"
                );
                if !input.requeue(fragment) {
                    break;
                }
            }
            None => {
                fragment.reject();
                debug!(
                    index = fragment.sequence_index,
                    attempt = fragment.attempt,
                    "Generation failed"
                );
                state.failures.fetch_add(1, Ordering::SeqCst);
                if !hand_over(state, &output, fragment).await {
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn hand_over(state: &RunState, output: &mpsc::Sender<Fragment>, fragment: Fragment) -> bool {
    tokio::select! {
        biased;
        () = state.token().cancelled() => false,
        sent = output.send(fragment) => sent.is_ok(),
    }
}

/// Printer stage: restores input order, passes fragments to the sink, and
/// detects the end of the run.
async fn print(
    shared: Arc<Shared>,
    mut output: mpsc::Receiver<Fragment>,
    sink: mpsc::Sender<Fragment>,
) -> Result<()> {
    let state = &shared.state;
    let mut buffer = ReorderBuffer::new();
    let mut reader_done = false;

    loop {
        tokio::select! {
            biased;
            () = state.token().cancelled() => break,
            received = output.recv() => {
                let Some(fragment) = received else { break };
                buffer.insert(fragment);
                if !drain(&shared, &mut buffer, &sink).await {
                    break;
                }
            }
            () = state.reading_finished(), if !reader_done => reader_done = true,
        }

        if state.is_drained() {
            debug!("Finished");
            state.stop(StopReason::Drained);
            break;
        }
    }

    if !buffer.is_empty() {
        debug!(next_index = buffer.next_index(), "Discarding unordered fragments");
    }
    Ok(())
}

/// Sends every fragment that is next in order to the sink. Returns false once
/// the sink is gone.
async fn drain(shared: &Shared, buffer: &mut ReorderBuffer, sink: &mpsc::Sender<Fragment>) -> bool {
    let state = &shared.state;

    while !state.is_aborted() {
        let Some(fragment) = buffer.pop_ready() else {
            break;
        };

        if fragment.successful {
            debug!(index = fragment.sequence_index, attempt = fragment.attempt, "Output");
        } else {
            info!(
                index = fragment.sequence_index,
                path = %fragment.source_path,
                line = fragment.start_line,
                lines = fragment.line_count,
                attempt = fragment.attempt,
                "Failed"
            );
        }
        let successful = fragment.successful;
        let sent = tokio::select! {
            biased;
            () = state.token().cancelled() => break,
            sent = sink.send(fragment) => sent.is_ok(),
        };
        if !sent {
            return false;
        }

        let emitted = state.fragment_emitted(successful);
        if shared.abort_after.is_some_and(|limit| emitted >= limit) {
            debug!(emitted, "Output limit reached");
            state.stop(StopReason::OutputLimit);
        }
    }

    true
}

/// Sink stage: writes fragments in the order received, then finishes the
/// emitter. Runs on the blocking thread pool.
fn write_outputs(mut sink: mpsc::Receiver<Fragment>, mut emitter: Box<dyn Emitter>) -> Result<()> {
    while let Some(fragment) = sink.blocking_recv() {
        emitter.emit(&fragment)?;
    }
    emitter.finish()
}

/// Stops the run once `limit` has elapsed.
async fn watch_time(shared: Arc<Shared>, limit: Duration) -> Result<()> {
    let state = &shared.state;
    tokio::select! {
        () = state.token().cancelled() => {}
        () = tokio::time::sleep(limit) => {
            info!(limit_secs = limit.as_secs_f64(), "Time limit reached");
            state.stop(StopReason::TimeLimit);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::Candidate;
    use crate::token::TokenizerKind;
    use crate::validate::ValidationMode;
    use assert_fs::prelude::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn model() -> ModelConfig {
        ModelConfig {
            context: 1_000,
            parallel: 4,
            prompt_template: Some("{{ system }}|{{ instruction }}|".to_string()),
            ..ModelConfig::new("test/model")
        }
    }

    fn config() -> crate::config::RunConfigBuilder {
        RunConfig::builder()
            .tokenizer(TokenizerKind::Simple)
            .system_prompt("sys")
    }

    /// `count` lines of 8 chars (2 simple tokens each) tagged with `tag`.
    fn lines(tag: &str, count: usize) -> String {
        (0..count).map(|i| format!("{tag:<4}{i:03}\n")).collect()
    }

    fn arg(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<Fragment>>>);

    impl Collect {
        fn fragments(&self) -> Vec<Fragment> {
            self.0.lock().unwrap().clone()
        }

        fn indices(&self) -> Vec<usize> {
            self.fragments().iter().map(|f| f.sequence_index).collect()
        }
    }

    impl Emitter for Collect {
        fn emit(&mut self, fragment: &Fragment) -> Result<()> {
            self.0.lock().unwrap().push(fragment.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Answers `out:<first input line>` after a delay chosen per input.
    struct Echo {
        delay: fn(&str) -> Duration,
        cost: u64,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Echo {
        fn new(delay: fn(&str) -> Duration) -> Self {
            Self {
                delay,
                cost: 10,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn instant() -> Self {
            Self::new(|_| Duration::ZERO)
        }
    }

    #[async_trait]
    impl Generator for Echo {
        async fn generate(
            &self,
            _system: &str,
            instruction: &str,
            params: &SamplingParams,
        ) -> Result<Vec<Candidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            tokio::time::sleep((self.delay)(instruction)).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            let first = instruction.lines().next().unwrap_or_default();
            Ok((0..params.n)
                .map(|_| Candidate {
                    text: format!("out:{first}"),
                    cost: self.cost,
                })
                .collect())
        }
    }

    /// Replays scripted answers, one per call; the last one repeats.
    struct Scripted {
        answers: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<&'static str>) -> Self {
            Self {
                answers,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn generate(&self, _: &str, _: &str, _: &SamplingParams) -> Result<Vec<Candidate>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let text = self.answers[call.min(self.answers.len() - 1)];
            Ok(vec![Candidate {
                text: text.to_string(),
                cost: 1,
            }])
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Generator for Unreachable {
        async fn generate(&self, _: &str, _: &str, _: &SamplingParams) -> Result<Vec<Candidate>> {
            Err(Error::generation("connection refused"))
        }
    }

    async fn run_with(
        config: RunConfig,
        generator: Arc<dyn Generator>,
        paths: &[String],
    ) -> (Result<RunReport>, Collect) {
        let collect = Collect::default();
        let pipeline = Pipeline::new(config, &model(), generator)
            .unwrap()
            .with_emitter(Box::new(collect.clone()));

        let report = tokio::time::timeout(TIMEOUT, pipeline.run(paths))
            .await
            .expect("pipeline did not terminate");
        (report, collect)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_short_file_is_one_fragment() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("short.txt");
        file.write_str(&lines("abc", 10)).unwrap();

        let config = config().chunk_size(300).build().unwrap();
        let (report, collect) =
            run_with(config, Arc::new(Echo::instant()), &[arg(file.path())]).await;
        let report = report.unwrap();

        assert_eq!(collect.indices(), vec![0]);
        let fragment = &collect.fragments()[0];
        assert_eq!(fragment.start_line, 1);
        assert_eq!(fragment.line_count, 10);
        assert_eq!(fragment.output_text, "out:abc 000");
        assert!(report.is_success());
        assert_eq!(report.stop_reason, Some(StopReason::Drained));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_files_emit_in_order_when_first_is_slow() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("a.txt").write_str(&lines("slow", 6)).unwrap();
        temp.child("b.txt").write_str(&lines("fast", 6)).unwrap();

        // 3 lines (6 tokens) per fragment.
        let config = config().chunk_size(7).build().unwrap();
        let echo = Echo::new(|input| {
            if input.starts_with("slow") {
                Duration::from_millis(80)
            } else {
                Duration::ZERO
            }
        });
        let paths = [arg(&temp.path().join("b.txt")), arg(&temp.path().join("a.txt"))];
        let (report, collect) = run_with(config, Arc::new(echo), &paths).await;
        let report = report.unwrap();

        assert_eq!(collect.indices(), vec![0, 1, 2, 3]);
        let outputs: Vec<String> = collect.fragments().into_iter().map(|f| f.output_text).collect();
        assert_eq!(
            outputs,
            vec!["out:slow000", "out:slow003", "out:fast000", "out:fast003"]
        );
        assert!(collect.fragments()[2].source_path.ends_with("b.txt"));
        assert_eq!(report.fragments, 4);
        assert_eq!(report.emitted, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_order_preserved_under_random_latency() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("many.txt");
        // One line per fragment.
        file.write_str(&lines("row", 24)).unwrap();

        let config = config().chunk_size(3).parallelism(8).build().unwrap();
        let echo = Echo::new(|input| {
            let n: u64 = input.trim()[3..].trim().parse().unwrap_or(0);
            Duration::from_millis((n * 37) % 11 * 3)
        });
        let (report, collect) = run_with(config, Arc::new(echo), &[arg(file.path())]).await;

        assert_eq!(collect.indices(), (0..24).collect::<Vec<_>>());
        assert!(report.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_retry_until_valid() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("one.txt");
        file.write_str("some input\n").unwrap();

        let config = config()
            .validation(ValidationMode::Regex)
            .pattern("^OK")
            .max_attempts(2)
            .build()
            .unwrap();
        let generator = Arc::new(Scripted::new(vec!["bad", "OK good"]));
        let (report, collect) = run_with(config, generator.clone(), &[arg(file.path())]).await;

        let fragments = collect.fragments();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].successful);
        assert_eq!(fragments[0].output_text, "OK good");
        assert_eq!(fragments[0].attempt, 2);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
        assert!(report.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_the_run() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("one.txt");
        file.write_str("some input\n").unwrap();

        let config = config()
            .pattern("^OK")
            .max_attempts(1)
            .build()
            .unwrap();
        let (report, collect) =
            run_with(config, Arc::new(Scripted::new(vec!["bad"])), &[arg(file.path())]).await;
        let report = report.unwrap();

        let fragments = collect.fragments();
        assert_eq!(fragments.len(), 1);
        assert!(!fragments[0].successful);
        assert_eq!(fragments[0].attempt, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("one.txt");
        file.write_str("some input\n").unwrap();

        let config = config()
            .validation(ValidationMode::Json)
            .max_attempts(3)
            .candidates(2)
            .build()
            .unwrap();
        let generator = Arc::new(Scripted::new(vec!["not json"]));
        let (report, collect) = run_with(config, generator.clone(), &[arg(file.path())]).await;

        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(collect.fragments()[0].attempt, 3);
        assert_eq!(report.unwrap().attempts, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_after_one_output() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("five.txt");
        file.write_str(&lines("row", 5)).unwrap();

        let config = config().chunk_size(3).abort_after(1).build().unwrap();
        let (report, collect) =
            run_with(config, Arc::new(Echo::instant()), &[arg(file.path())]).await;
        let report = report.unwrap();

        assert_eq!(collect.indices(), vec![0]);
        assert_eq!(report.emitted, 1);
        assert_eq!(report.stop_reason, Some(StopReason::OutputLimit));
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_budget_stops_the_run() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("five.txt");
        file.write_str(&lines("row", 5)).unwrap();

        let config = config()
            .chunk_size(3)
            .parallelism(1)
            .budget(15)
            .build()
            .unwrap();
        let (report, collect) =
            run_with(config, Arc::new(Echo::instant()), &[arg(file.path())]).await;
        let report = report.unwrap();

        assert_eq!(report.stop_reason, Some(StopReason::Budget));
        assert_eq!(report.cost, 20);
        assert!(collect.indices().len() <= 2);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_time_limit_stops_the_run() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("rows.txt");
        file.write_str(&lines("row", 10)).unwrap();

        let config = config()
            .chunk_size(3)
            .parallelism(1)
            .time_limit(Duration::from_millis(50))
            .build()
            .unwrap();
        let echo = Echo::new(|_| Duration::from_millis(200));
        let (report, collect) = run_with(config, Arc::new(echo), &[arg(file.path())]).await;
        let report = report.unwrap();

        assert_eq!(report.stop_reason, Some(StopReason::TimeLimit));
        assert!(collect.indices().len() < 10);
        assert!(report.duration < Duration::from_secs(2));
        // The generation in flight at the stop still finishes and is paid for.
        assert_eq!(report.cost, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_generation_permits_cap_concurrency() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("rows.txt");
        file.write_str(&lines("row", 12)).unwrap();

        let config = config()
            .chunk_size(3)
            .parallelism(6)
            .max_concurrent_generations(2)
            .build()
            .unwrap();
        let echo = Arc::new(Echo::new(|_| Duration::from_millis(15)));
        let (report, collect) = run_with(config, echo.clone(), &[arg(file.path())]).await;

        assert_eq!(collect.indices().len(), 12);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 12);
        assert!(echo.max_active.load(Ordering::SeqCst) <= 2);
        assert!(report.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_no_files_is_a_failure() {
        let config = config().build().unwrap();
        let (report, collect) = run_with(config, Arc::new(Echo::instant()), &[]).await;
        let report = report.unwrap();

        assert_eq!(report.files, 0);
        assert!(report.stop_reason.is_none());
        assert!(!report.is_success());
        assert!(collect.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_blank_file_terminates_without_fragments() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("blank.txt");
        file.write_str("\n   \n\t\n").unwrap();

        let config = config().build().unwrap();
        let (report, _) = run_with(config, Arc::new(Echo::instant()), &[arg(file.path())]).await;
        let report = report.unwrap();

        assert_eq!(report.fragments, 0);
        assert_eq!(report.stop_reason, Some(StopReason::Drained));
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_undecodable_file_is_skipped() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("a.txt").write_binary(b"\xff\xfe\xfd broken\n").unwrap();
        temp.child("b.txt").write_str("fine\n").unwrap();
        let paths = [arg(&temp.path().join("a.txt")), arg(&temp.path().join("b.txt"))];

        let config = config().build().unwrap();
        let (report, collect) = run_with(config, Arc::new(Echo::instant()), &paths).await;
        let report = report.unwrap();

        assert_eq!(collect.fragments().len(), 1);
        assert_eq!(collect.fragments()[0].output_text, "out:fine");
        assert_eq!(report.files, 2);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_missing_path_is_not_a_success() {
        let temp = assert_fs::TempDir::new().unwrap();
        let missing = arg(&temp.path().join("definitely/missing.txt"));

        let config = config().build().unwrap();
        let (report, collect) = run_with(config, Arc::new(Echo::instant()), &[missing]).await;
        let report = report.unwrap();

        assert_eq!(report.files, 0);
        assert_eq!(report.fragments, 0);
        assert!(!report.is_success());
        assert!(collect.fragments().is_empty());
    }

    #[tokio::test]
    async fn test_missing_path_next_to_readable_one() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("here.txt").write_str("fine\n").unwrap();
        let paths = [
            arg(&temp.path().join("gone.txt")),
            arg(&temp.path().join("here.txt")),
        ];

        let config = config().build().unwrap();
        let (report, collect) = run_with(config, Arc::new(Echo::instant()), &paths).await;
        let report = report.unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(collect.fragments().len(), 1);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_latin1_input_needs_matching_encoding() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("latin1.txt");
        file.write_binary(b"caf\xe9\n").unwrap();

        let latin1 = crate::decode::encoding_for_label("latin1").unwrap();
        let config = config().encoding(latin1).build().unwrap();
        let (report, collect) =
            run_with(config, Arc::new(Echo::instant()), &[arg(file.path())]).await;

        assert_eq!(collect.fragments().len(), 1);
        assert_eq!(collect.fragments()[0].output_text, "out:caf\u{e9}");
        assert!(report.unwrap().is_success());

        let config = self::config().build().unwrap();
        let (report, collect) =
            run_with(config, Arc::new(Echo::instant()), &[arg(file.path())]).await;

        assert!(collect.fragments().is_empty());
        assert_eq!(report.unwrap().fragments, 0);
    }

    /// Blocks in `emit` until released, like a stalled pipe.
    struct Stalled {
        gate: std::sync::mpsc::Receiver<()>,
        out: Collect,
    }

    impl Emitter for Stalled {
        fn emit(&mut self, fragment: &Fragment) -> Result<()> {
            let _ = self.gate.recv_timeout(Duration::from_secs(2));
            self.out.emit(fragment)
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_output_does_not_block_the_runtime() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("one.txt");
        file.write_str("input\n").unwrap();

        let (release, gate) = std::sync::mpsc::channel();
        let out = Collect::default();
        let pipeline = Pipeline::new(config().build().unwrap(), &model(), Arc::new(Echo::instant()))
            .unwrap()
            .with_emitter(Box::new(Stalled {
                gate,
                out: out.clone(),
            }));
        let paths = [arg(file.path())];
        let run = tokio::spawn(async move { pipeline.run(&paths).await });

        // Single-threaded runtime: this timer only fires on time if no task
        // is stuck in the emitter.
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let slept = started.elapsed();
        let _ = release.send(());

        let report = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();
        assert!(slept < Duration::from_secs(1), "slept {slept:?}");
        assert_eq!(out.indices(), vec![0]);
        assert_eq!(report.emitted, 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried_by_default() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("one.txt");
        file.write_str("input\n").unwrap();

        let config = config().max_attempts(2).build().unwrap();
        let (report, collect) =
            run_with(config, Arc::new(Unreachable), &[arg(file.path())]).await;
        let report = report.unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(report.failed, 1);
        assert!(!collect.fragments()[0].successful);
    }

    #[tokio::test]
    async fn test_transport_error_can_abort_the_run() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("one.txt");
        file.write_str("input\n").unwrap();

        let config = config()
            .transport_errors(TransportErrorPolicy::Abort)
            .build()
            .unwrap();
        let (report, _) = run_with(config, Arc::new(Unreachable), &[arg(file.path())]).await;

        assert!(report.unwrap_err().is_generation());
    }

    #[tokio::test]
    async fn test_paths_are_deduplicated() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("one.txt");
        file.write_str("input\n").unwrap();
        let dotted = arg(&temp.path().join(".").join("one.txt"));

        let config = config().build().unwrap();
        let (report, collect) =
            run_with(config, Arc::new(Echo::instant()), &[arg(file.path()), dotted]).await;

        assert_eq!(report.unwrap().files, 1);
        assert_eq!(collect.fragments().len(), 1);
    }

    #[test]
    fn test_defaults_derived_from_model() {
        let pipeline =
            Pipeline::new(config().candidates(3).build().unwrap(), &model(), Arc::new(Echo::instant()))
                .unwrap();

        // "sys||" is two simple tokens: 1000 / 3 and 1000 - 2 - 333
        assert_eq!(pipeline.chunk_size(), 333);
        assert_eq!(pipeline.sampling_params().max_tokens, Some(665));
        assert_eq!(pipeline.sampling_params().n, 3);
    }

    #[test]
    fn test_chunk_size_must_fit_context() {
        let too_big = config().chunk_size(1_000).build().unwrap();
        assert!(Pipeline::new(too_big, &model(), Arc::new(Echo::instant())).is_err());

        let no_room_left = config().chunk_size(998).build().unwrap();
        let err = Pipeline::new(no_room_left, &model(), Arc::new(Echo::instant()))
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_temperature_override() {
        let pipeline = Pipeline::new(
            config().temperature(0.1).build().unwrap(),
            &model(),
            Arc::new(Echo::instant()),
        )
        .unwrap();

        assert!((pipeline.sampling_params().temperature - 0.1).abs() < f32::EPSILON);
    }
}
