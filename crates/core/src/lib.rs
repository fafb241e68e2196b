//! `batchforge-core`: batch domain building blocks.
//!
//! This crate contains **pure domain** primitives (no IO, no storage, no
//! threads): identifiers, statuses, job parameters, execution context and
//! the execution records the engine persists.

pub mod context;
pub mod error;
pub mod execution;
pub mod id;
pub mod parameters;
pub mod status;

pub use context::ExecutionContext;
pub use error::{BatchError, BatchResult};
pub use execution::{ChunkCounts, ExecutionSummary, JobExecution, JobInstance, StepExecution};
pub use id::{JobExecutionId, JobInstanceId, StepExecutionId};
pub use parameters::{JobParameter, JobParameters, JobParametersBuilder, ParameterValue};
pub use status::{BatchStatus, ExitStatus};
