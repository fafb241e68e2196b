//! Step and chunk lifecycle callbacks.
//!
//! Listener failures never change the outcome of a step; they are logged and
//! appended to the exit description.

use std::sync::Arc;

use thiserror::Error;

use batchforge_core::{ExitStatus, StepExecution};

use super::skip::ItemPhase;
use crate::item::ItemError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub trait StepExecutionListener: Send + Sync {
    fn before_step(&self, _step: &StepExecution) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Returning an exit status combines it (see [`ExitStatus::and`]) with
    /// the one the step computed.
    fn after_step(&self, _step: &StepExecution) -> Result<Option<ExitStatus>, ListenerError> {
        Ok(None)
    }
}

pub trait ChunkListener: Send + Sync {
    fn before_chunk(&self, _step: &StepExecution) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called after commit with the counters already updated.
    fn after_chunk(&self, _step: &StepExecution) -> Result<(), ListenerError> {
        Ok(())
    }

    fn after_chunk_error(&self, _step: &StepExecution, _error: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_skip(&self, _phase: ItemPhase, _error: &ItemError) -> Result<(), ListenerError> {
        Ok(())
    }
}

impl<T: StepExecutionListener + ?Sized> StepExecutionListener for Arc<T> {
    fn before_step(&self, step: &StepExecution) -> Result<(), ListenerError> {
        (**self).before_step(step)
    }

    fn after_step(&self, step: &StepExecution) -> Result<Option<ExitStatus>, ListenerError> {
        (**self).after_step(step)
    }
}

impl<T: ChunkListener + ?Sized> ChunkListener for Arc<T> {
    fn before_chunk(&self, step: &StepExecution) -> Result<(), ListenerError> {
        (**self).before_chunk(step)
    }

    fn after_chunk(&self, step: &StepExecution) -> Result<(), ListenerError> {
        (**self).after_chunk(step)
    }

    fn after_chunk_error(&self, step: &StepExecution, error: &str) -> Result<(), ListenerError> {
        (**self).after_chunk_error(step, error)
    }

    fn on_skip(&self, phase: ItemPhase, error: &ItemError) -> Result<(), ListenerError> {
        (**self).on_skip(phase, error)
    }
}
