//! Steps and the chunk-oriented step executor.
//!
//! A [`Step`] is one stage of a job. [`ChunkStep`] is the read/process/write
//! implementation: it pulls items through the item pipeline in chunks and
//! commits each chunk as a unit.

pub mod chunk;
pub mod listener;
pub mod skip;
pub mod transaction;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use batchforge_core::{BatchError, JobExecution, StepExecution};

use crate::store::ExecutionStore;

pub use chunk::{ChunkStep, ChunkStepBuilder, ProcessorFactory, ReaderFactory, WriterFactory};
pub use listener::{ChunkListener, ListenerError, StepExecutionListener};
pub use skip::{ItemPhase, LimitedSkip, NeverSkip, SkipDecision, SkipPolicy};
pub use transaction::{ChunkTransaction, ResourcelessTransactionManager, TransactionManager};

/// Chunking configuration handed to a chunk step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Outputs buffered before the writer is called.
    pub chunk_size: usize,
    /// Every chunk is its own transaction. Always true; kept explicit.
    pub commit_on_every_chunk: bool,
}

impl ChunkConfig {
    pub const DEFAULT_CHUNK_SIZE: usize = 100;

    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            commit_on_every_chunk: true,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHUNK_SIZE)
    }
}

/// Cooperative stop flag shared between an execution and whoever may stop it.
///
/// Observed only at chunk and step boundaries.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stop: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// What a step sees of the job execution running it.
pub struct StepContext<'a> {
    pub job_execution: &'a JobExecution,
    pub store: &'a dyn ExecutionStore,
    pub stop: &'a StopToken,
}

/// One stage of a job.
///
/// `execute` drives the given step execution to a terminal status and
/// persists it. An `Err` means the step could not record its own outcome
/// (the store failed); the runner then fails the job.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Run the step again on restart even if it already COMPLETED.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// How many times this step may be started within one job instance.
    fn start_limit(&self) -> u32 {
        u32::MAX
    }

    fn execute(&self, step_execution: &mut StepExecution, ctx: &StepContext<'_>)
    -> Result<(), BatchError>;
}

impl<S> Step for Arc<S>
where
    S: Step + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn allow_start_if_complete(&self) -> bool {
        (**self).allow_start_if_complete()
    }

    fn start_limit(&self) -> u32 {
        (**self).start_limit()
    }

    fn execute(
        &self,
        step_execution: &mut StepExecution,
        ctx: &StepContext<'_>,
    ) -> Result<(), BatchError> {
        (**self).execute(step_execution, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_at_least_one() {
        assert_eq!(ChunkConfig::new(0).chunk_size, 1);
        assert_eq!(ChunkConfig::default().chunk_size, 100);
        assert!(ChunkConfig::default().commit_on_every_chunk);
    }

    #[test]
    fn stop_token_is_shared_between_clones() {
        let token = StopToken::new();
        let observer = token.clone();
        assert!(!observer.is_stop_requested());
        token.request_stop();
        assert!(observer.is_stop_requested());
    }
}
