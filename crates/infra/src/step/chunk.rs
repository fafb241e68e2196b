//! Chunk-oriented step execution.
//!
//! Per chunk:
//!
//! 1. check the stop token, begin a transaction
//! 2. read and process items until `chunk_size` outputs are buffered or the
//!    reader is exhausted (filtered and skipped items do not count)
//! 3. hand the buffer to the writer once
//! 4. fold the chunk's counters into a copy of the step execution, let the
//!    streams save their position into its context, persist it
//! 5. commit the writer, then the transaction
//!
//! A failure anywhere in 2-5 rolls back the chunk: counters and stream
//! positions stay at the last committed chunk, so a restart resumes right
//! after it and a staging writer never publishes the chunk twice.

use std::sync::Arc;

use tracing::{debug, info, warn};

use batchforge_core::{
    BatchError, BatchStatus, ChunkCounts, ExecutionContext, ExitStatus, JobParameters,
    StepExecution,
};

use super::listener::{ChunkListener, StepExecutionListener};
use super::skip::{ItemPhase, NeverSkip, SkipDecision, SkipPolicy};
use super::transaction::{ChunkTransaction, ResourcelessTransactionManager, TransactionManager};
use super::{ChunkConfig, Step, StepContext};
use crate::item::{Chunk, ItemError, ItemProcessor, ItemReader, ItemWriter};

/// Builds a reader for one step execution.
pub type ReaderFactory<I> = Arc<
    dyn Fn(&JobParameters, &ExecutionContext) -> Result<Box<dyn ItemReader<I>>, ItemError>
        + Send
        + Sync,
>;

/// Builds a processor for one step execution.
pub type ProcessorFactory<I, O> = Arc<
    dyn Fn(&JobParameters, &ExecutionContext) -> Result<Box<dyn ItemProcessor<I, O>>, ItemError>
        + Send
        + Sync,
>;

/// Builds a writer for one step execution.
pub type WriterFactory<O> = Arc<
    dyn Fn(&JobParameters, &ExecutionContext) -> Result<Box<dyn ItemWriter<O>>, ItemError>
        + Send
        + Sync,
>;

/// Why the chunk loop ended early.
#[derive(Debug)]
enum StepFailure {
    Item(ItemError),
    SkipLimitExceeded { limit: u64, error: ItemError },
    Store(BatchError),
}

impl core::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StepFailure::Item(e) => write!(f, "{e}"),
            StepFailure::SkipLimitExceeded { limit, error } => {
                write!(f, "skip limit of {limit} exceeded: {error}")
            }
            StepFailure::Store(e) => write!(f, "{e}"),
        }
    }
}

enum LoopEnd {
    Exhausted,
    Stopped,
}

struct ChunkOutcome {
    counts: ChunkCounts,
    exhausted: bool,
}

impl ChunkOutcome {
    fn consumed_input(&self) -> bool {
        self.counts.read > 0 || self.counts.read_skips > 0
    }
}

struct Components<I, O> {
    reader: Box<dyn ItemReader<I>>,
    processor: Box<dyn ItemProcessor<I, O>>,
    writer: Box<dyn ItemWriter<O>>,
}

/// A read/process/write step committed in chunks.
pub struct ChunkStep<I, O> {
    name: String,
    config: ChunkConfig,
    reader: ReaderFactory<I>,
    processor: ProcessorFactory<I, O>,
    writer: WriterFactory<O>,
    skip_policy: Arc<dyn SkipPolicy>,
    transaction_manager: Arc<dyn TransactionManager>,
    step_listeners: Vec<Arc<dyn StepExecutionListener>>,
    chunk_listeners: Vec<Arc<dyn ChunkListener>>,
    allow_start_if_complete: bool,
    start_limit: u32,
}

impl<I, O> ChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn builder(name: impl Into<String>, config: ChunkConfig) -> ChunkStepBuilder<I, O> {
        ChunkStepBuilder {
            name: name.into(),
            config,
            reader: None,
            processor: None,
            writer: None,
            skip_policy: Arc::new(NeverSkip),
            transaction_manager: Arc::new(ResourcelessTransactionManager::new()),
            step_listeners: Vec::new(),
            chunk_listeners: Vec::new(),
            allow_start_if_complete: false,
            start_limit: u32::MAX,
        }
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    fn open(&self, step: &StepExecution, ctx: &StepContext<'_>) -> Result<Components<I, O>, ItemError> {
        let params = &ctx.job_execution.parameters;
        let context = &step.execution_context;
        let mut reader = (self.reader)(params, context)?;
        let processor = (self.processor)(params, context)?;
        let mut writer = (self.writer)(params, context)?;
        reader.open(context)?;
        if let Err(e) = writer.open(context) {
            let _ = reader.close();
            return Err(e);
        }
        Ok(Components {
            reader,
            processor,
            writer,
        })
    }

    fn chunk_loop(
        &self,
        components: &mut Components<I, O>,
        step: &mut StepExecution,
        ctx: &StepContext<'_>,
        notes: &mut Vec<String>,
    ) -> Result<LoopEnd, StepFailure> {
        loop {
            if ctx.stop.is_stop_requested() {
                info!(step = %self.name, step_execution_id = %step.id, "stop requested, halting before next chunk");
                return Ok(LoopEnd::Stopped);
            }

            let tx = self.transaction_manager.begin().map_err(StepFailure::Item)?;
            for listener in &self.chunk_listeners {
                if let Err(e) = listener.before_chunk(step) {
                    self.note_listener_failure(notes, "before_chunk", &e);
                }
            }

            let outcome = match self.fill_and_write(components, step, notes) {
                Ok(outcome) => outcome,
                Err(failure) => return Err(self.roll_back(components, tx, step, failure, notes)),
            };

            if !outcome.consumed_input() {
                tx.commit().map_err(StepFailure::Item)?;
                return Ok(LoopEnd::Exhausted);
            }

            // Progress is recorded before anything is published, so a restart
            // resumes after exactly the chunks that were committed.
            let updated = match self.save_progress(components, step, ctx, outcome.counts) {
                Ok(updated) => updated,
                Err(failure) => return Err(self.roll_back(components, tx, step, failure, notes)),
            };
            if let Err(e) = components.writer.commit() {
                return Err(self.roll_back(components, tx, step, StepFailure::Item(e), notes));
            }
            if let Err(e) = tx.commit() {
                step.mark_rolled_back();
                return Err(StepFailure::Item(e));
            }
            *step = updated;

            debug!(
                step = %self.name,
                step_execution_id = %step.id,
                commit = step.commit_count,
                read = step.read_count,
                written = step.write_count,
                filtered = step.filter_count,
                skipped = step.skip_count(),
                "chunk committed"
            );
            for listener in &self.chunk_listeners {
                if let Err(e) = listener.after_chunk(step) {
                    self.note_listener_failure(notes, "after_chunk", &e);
                }
            }

            if outcome.exhausted {
                return Ok(LoopEnd::Exhausted);
            }
        }
    }

    /// Fold a chunk into a copy of the step and persist it, stream state
    /// included. `step` is untouched if this fails.
    fn save_progress(
        &self,
        components: &mut Components<I, O>,
        step: &StepExecution,
        ctx: &StepContext<'_>,
        counts: ChunkCounts,
    ) -> Result<StepExecution, StepFailure> {
        let mut updated = step.clone();
        updated.apply_chunk(counts);
        components
            .reader
            .update(&mut updated.execution_context)
            .map_err(StepFailure::Item)?;
        components
            .writer
            .update(&mut updated.execution_context)
            .map_err(StepFailure::Item)?;
        ctx.store
            .update_step_execution(&updated)
            .map_err(|e| StepFailure::Store(e.into()))?;
        Ok(updated)
    }

    fn roll_back(
        &self,
        components: &mut Components<I, O>,
        tx: Box<dyn ChunkTransaction>,
        step: &mut StepExecution,
        failure: StepFailure,
        notes: &mut Vec<String>,
    ) -> StepFailure {
        components.writer.rollback();
        if let Err(e) = tx.rollback() {
            warn!(step = %self.name, error = %e, "rollback failed");
        }
        step.mark_rolled_back();
        let description = failure.to_string();
        warn!(
            step = %self.name,
            step_execution_id = %step.id,
            committed_writes = step.write_count,
            error = %description,
            "chunk rolled back"
        );
        for listener in &self.chunk_listeners {
            if let Err(e) = listener.after_chunk_error(step, &description) {
                self.note_listener_failure(notes, "after_chunk_error", &e);
            }
        }
        failure
    }

    fn fill_and_write(
        &self,
        components: &mut Components<I, O>,
        step: &StepExecution,
        notes: &mut Vec<String>,
    ) -> Result<ChunkOutcome, StepFailure> {
        let mut outputs = Vec::with_capacity(self.config.chunk_size);
        let mut counts = ChunkCounts::default();
        let mut exhausted = false;

        while outputs.len() < self.config.chunk_size {
            let skips_so_far = step.skip_count() + counts.read_skips + counts.process_skips;
            let item = match components.reader.read() {
                Ok(Some(item)) => item,
                Ok(None) => {
                    exhausted = true;
                    break;
                }
                Err(e) => {
                    self.skip_or_fail(e, ItemPhase::Read, skips_so_far, notes)?;
                    counts.read_skips += 1;
                    continue;
                }
            };
            counts.read += 1;

            match components.processor.process(item) {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => counts.filtered += 1,
                Err(e) => {
                    self.skip_or_fail(e, ItemPhase::Process, skips_so_far, notes)?;
                    counts.process_skips += 1;
                }
            }
        }

        if !outputs.is_empty() {
            let chunk = Chunk::new(outputs);
            components.writer.write(&chunk).map_err(StepFailure::Item)?;
            counts.written = chunk.len() as u64;
        }

        Ok(ChunkOutcome { counts, exhausted })
    }

    fn skip_or_fail(
        &self,
        error: ItemError,
        phase: ItemPhase,
        skips_so_far: u64,
        notes: &mut Vec<String>,
    ) -> Result<(), StepFailure> {
        match self.skip_policy.classify(&error, phase, skips_so_far) {
            SkipDecision::Skip => {
                debug!(step = %self.name, %phase, error = %error, "item skipped");
                for listener in &self.chunk_listeners {
                    if let Err(e) = listener.on_skip(phase, &error) {
                        self.note_listener_failure(notes, "on_skip", &e);
                    }
                }
                Ok(())
            }
            SkipDecision::Fail => Err(StepFailure::Item(error)),
            SkipDecision::LimitExceeded { limit } => {
                Err(StepFailure::SkipLimitExceeded { limit, error })
            }
        }
    }

    fn note_listener_failure(&self, notes: &mut Vec<String>, hook: &str, error: &impl core::fmt::Display) {
        warn!(step = %self.name, hook, error = %error, "step listener failed");
        notes.push(format!("{hook}: {error}"));
    }
}

impl<I, O> Step for ChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    fn start_limit(&self) -> u32 {
        self.start_limit
    }

    fn execute(&self, step: &mut StepExecution, ctx: &StepContext<'_>) -> Result<(), BatchError> {
        let mut notes = Vec::new();
        step.mark_started();
        for listener in &self.step_listeners {
            if let Err(e) = listener.before_step(step) {
                self.note_listener_failure(&mut notes, "before_step", &e);
            }
        }
        ctx.store.update_step_execution(step)?;
        info!(
            step = %self.name,
            step_execution_id = %step.id,
            execution_id = %ctx.job_execution.id,
            chunk_size = self.config.chunk_size,
            "step started"
        );

        let result = match self.open(step, ctx) {
            Ok(mut components) => {
                let result = self.chunk_loop(&mut components, step, ctx, &mut notes);
                let close_reader = components.reader.close();
                let close_writer = components.writer.close();
                match (result, close_reader.and(close_writer)) {
                    (Ok(_), Err(e)) => Err(StepFailure::Item(e)),
                    (Err(failure), Err(e)) => {
                        notes.push(format!("close: {e}"));
                        Err(failure)
                    }
                    (result, Ok(())) => result,
                }
            }
            Err(e) => Err(StepFailure::Item(e)),
        };

        let mut store_failure = None;
        let (status, mut exit) = match result {
            Ok(LoopEnd::Exhausted) => (BatchStatus::Completed, ExitStatus::completed()),
            Ok(LoopEnd::Stopped) => (
                BatchStatus::Stopped,
                ExitStatus::stopped().with_description("stop requested"),
            ),
            Err(failure) => {
                let exit = ExitStatus::failed().with_description(failure.to_string());
                if let StepFailure::Store(e) = failure {
                    store_failure = Some(e);
                }
                (BatchStatus::Failed, exit)
            }
        };

        step.status = status;
        step.exit_status = exit.clone();
        for listener in &self.step_listeners {
            match listener.after_step(step) {
                Ok(Some(extra)) => exit = exit.and(extra),
                Ok(None) => {}
                Err(e) => self.note_listener_failure(&mut notes, "after_step", &e),
            }
        }
        for note in &notes {
            exit = exit.add_description(note);
        }
        step.finish(status, exit);

        info!(
            step = %self.name,
            step_execution_id = %step.id,
            status = %step.status,
            exit_code = %step.exit_status.exit_code,
            read = step.read_count,
            written = step.write_count,
            skipped = step.skip_count(),
            rollbacks = step.rollback_count,
            "step finished"
        );

        let persisted = ctx.store.update_step_execution(step);
        if let Some(e) = store_failure {
            return Err(e);
        }
        persisted.map_err(Into::into)
    }
}

/// Builder for [`ChunkStep`]. Reader, processor and writer are required.
pub struct ChunkStepBuilder<I, O> {
    name: String,
    config: ChunkConfig,
    reader: Option<ReaderFactory<I>>,
    processor: Option<ProcessorFactory<I, O>>,
    writer: Option<WriterFactory<O>>,
    skip_policy: Arc<dyn SkipPolicy>,
    transaction_manager: Arc<dyn TransactionManager>,
    step_listeners: Vec<Arc<dyn StepExecutionListener>>,
    chunk_listeners: Vec<Arc<dyn ChunkListener>>,
    allow_start_if_complete: bool,
    start_limit: u32,
}

impl<I, O> ChunkStepBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn reader<F>(mut self, factory: F) -> Self
    where
        F: Fn(&JobParameters, &ExecutionContext) -> Result<Box<dyn ItemReader<I>>, ItemError>
            + Send
            + Sync
            + 'static,
    {
        self.reader = Some(Arc::new(factory));
        self
    }

    pub fn processor<F>(mut self, factory: F) -> Self
    where
        F: Fn(&JobParameters, &ExecutionContext) -> Result<Box<dyn ItemProcessor<I, O>>, ItemError>
            + Send
            + Sync
            + 'static,
    {
        self.processor = Some(Arc::new(factory));
        self
    }

    /// Use one shared processor instance for every execution.
    pub fn shared_processor(self, processor: Arc<dyn ItemProcessor<I, O>>) -> Self {
        self.processor(move |_, _| Ok(Box::new(processor.clone())))
    }

    pub fn writer<F>(mut self, factory: F) -> Self
    where
        F: Fn(&JobParameters, &ExecutionContext) -> Result<Box<dyn ItemWriter<O>>, ItemError>
            + Send
            + Sync
            + 'static,
    {
        self.writer = Some(Arc::new(factory));
        self
    }

    pub fn skip_policy(mut self, policy: impl SkipPolicy + 'static) -> Self {
        self.skip_policy = Arc::new(policy);
        self
    }

    pub fn transaction_manager(mut self, manager: impl TransactionManager + 'static) -> Self {
        self.transaction_manager = Arc::new(manager);
        self
    }

    pub fn listener(mut self, listener: impl StepExecutionListener + 'static) -> Self {
        self.step_listeners.push(Arc::new(listener));
        self
    }

    pub fn chunk_listener(mut self, listener: impl ChunkListener + 'static) -> Self {
        self.chunk_listeners.push(Arc::new(listener));
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn start_limit(mut self, limit: u32) -> Self {
        self.start_limit = limit;
        self
    }

    pub fn build(self) -> Result<ChunkStep<I, O>, BatchError> {
        let missing = |part: &str| {
            BatchError::illegal_state(format!("step {} has no {part}", self.name))
        };
        let reader = self.reader.clone().ok_or_else(|| missing("reader"))?;
        let processor = self.processor.clone().ok_or_else(|| missing("processor"))?;
        let writer = self.writer.clone().ok_or_else(|| missing("writer"))?;
        Ok(ChunkStep {
            name: self.name,
            config: self.config,
            reader,
            processor,
            writer,
            skip_policy: self.skip_policy,
            transaction_manager: self.transaction_manager,
            step_listeners: self.step_listeners,
            chunk_listeners: self.chunk_listeners,
            allow_start_if_complete: self.allow_start_if_complete,
            start_limit: self.start_limit,
        })
    }
}
