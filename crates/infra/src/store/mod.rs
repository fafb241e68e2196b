//! Execution store boundary.
//!
//! The store is the single source of truth for job instances, job executions,
//! step executions and their execution contexts. Every write is a full
//! snapshot of the record (overwrite-by-id), so concurrent readers never see a
//! torn record.
//!
//! The trait is synchronous: the engine runs on plain worker threads and the
//! Postgres implementation bridges into the tokio runtime it was built on.

pub mod in_memory;
pub mod postgres;

#[cfg(test)]
pub(crate) mod flaky;

use std::sync::Arc;

use thiserror::Error;

use batchforge_core::{
    BatchError, BatchStatus, JobExecution, JobExecutionId, JobInstance, JobInstanceId, JobParameters,
    StepExecution,
};

pub use in_memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;

/// Execution store operation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A job instance with the same name and identity key already exists.
    #[error("job instance already exists: job={job_name} identity={identity}")]
    DuplicateInstance { job_name: String, identity: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for BatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => BatchError::NotFound(what),
            StoreError::DuplicateInstance { job_name, identity } => {
                BatchError::DuplicateInstance { job_name, identity }
            }
            other => BatchError::Store(other.to_string()),
        }
    }
}

/// Durable repository of batch metadata.
pub trait ExecutionStore: Send + Sync {
    /// Create the instance for `(job_name, identifying(params))`.
    ///
    /// Fails with [`StoreError::DuplicateInstance`] when that identity already
    /// exists; this is the atomic guard of the launch race.
    fn create_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, StoreError>;

    /// Look up an instance by job name and the identifying subset of `params`.
    fn find_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<Option<JobInstance>, StoreError>;

    fn get_job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError>;

    /// Create a new execution of `instance` in STARTING.
    fn create_job_execution(
        &self,
        instance: &JobInstance,
        params: JobParameters,
    ) -> Result<JobExecution, StoreError>;

    /// Overwrite the execution record and its context. Step executions are
    /// saved separately and are ignored here.
    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), StoreError>;

    /// Overwrite the execution record only while its stored status is one of
    /// `expected`. Returns `false`, leaving the record alone, otherwise.
    fn update_job_execution_if_status(
        &self,
        execution: &JobExecution,
        expected: &[BatchStatus],
    ) -> Result<bool, StoreError>;

    /// Execution by id, with its step executions attached in creation order.
    fn find_job_execution(&self, id: JobExecutionId)
    -> Result<Option<JobExecution>, StoreError>;

    /// Most recently created execution of an instance.
    fn last_job_execution(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Option<JobExecution>, StoreError>;

    /// All executions of an instance, oldest first.
    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, StoreError>;

    /// Executions in STARTING, STARTED or STOPPING, optionally for one job.
    fn find_running_job_executions(
        &self,
        job_name: Option<&str>,
    ) -> Result<Vec<JobExecution>, StoreError>;

    fn create_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
    ) -> Result<StepExecution, StoreError>;

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), StoreError>;

    /// Step executions of one job execution, in creation order.
    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError>;

    /// Latest execution of `step_name` across every execution of the instance.
    fn last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError>;

    /// How many times `step_name` has been started within the instance.
    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<u32, StoreError>;
}

impl<S> ExecutionStore for Arc<S>
where
    S: ExecutionStore + ?Sized,
{
    fn create_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, StoreError> {
        (**self).create_job_instance(job_name, params)
    }

    fn find_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<Option<JobInstance>, StoreError> {
        (**self).find_job_instance(job_name, params)
    }

    fn get_job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        (**self).get_job_instance(id)
    }

    fn create_job_execution(
        &self,
        instance: &JobInstance,
        params: JobParameters,
    ) -> Result<JobExecution, StoreError> {
        (**self).create_job_execution(instance, params)
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        (**self).update_job_execution(execution)
    }

    fn update_job_execution_if_status(
        &self,
        execution: &JobExecution,
        expected: &[BatchStatus],
    ) -> Result<bool, StoreError> {
        (**self).update_job_execution_if_status(execution, expected)
    }

    fn find_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, StoreError> {
        (**self).find_job_execution(id)
    }

    fn last_job_execution(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Option<JobExecution>, StoreError> {
        (**self).last_job_execution(instance_id)
    }

    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, StoreError> {
        (**self).find_job_executions(instance_id)
    }

    fn find_running_job_executions(
        &self,
        job_name: Option<&str>,
    ) -> Result<Vec<JobExecution>, StoreError> {
        (**self).find_running_job_executions(job_name)
    }

    fn create_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
    ) -> Result<StepExecution, StoreError> {
        (**self).create_step_execution(job_execution_id, step_name)
    }

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), StoreError> {
        (**self).update_step_execution(step)
    }

    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError> {
        (**self).find_step_executions(job_execution_id)
    }

    fn last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        (**self).last_step_execution(instance_id, step_name)
    }

    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<u32, StoreError> {
        (**self).step_execution_count(instance_id, step_name)
    }
}
