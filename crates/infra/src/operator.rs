//! Operator actions on executions: stop, abandon and orphan recovery.

use std::sync::Arc;

use tracing::{info, warn};

use batchforge_core::{BatchError, BatchStatus, ExitStatus, JobExecution, JobExecutionId};

use crate::launch::RunningExecutions;
use crate::store::ExecutionStore;

pub const ORPHANED_DESCRIPTION: &str = "orphaned by process restart";

const RUNNING: &[BatchStatus] = &[BatchStatus::Starting, BatchStatus::Started, BatchStatus::Stopping];

fn already_finished(id: JobExecutionId, status: BatchStatus) -> BatchError {
    BatchError::illegal_state(format!("execution {id} is {status} and cannot be stopped"))
}

pub struct JobOperator {
    store: Arc<dyn ExecutionStore>,
    running: Arc<RunningExecutions>,
}

impl JobOperator {
    /// `running` must be the registry of the launcher whose executions this
    /// operator controls.
    pub fn new(store: Arc<dyn ExecutionStore>, running: Arc<RunningExecutions>) -> Self {
        Self { store, running }
    }

    /// Request a graceful stop.
    ///
    /// The execution moves to STOPPING and the worker stops at the next chunk
    /// boundary. An execution recorded as running but not owned by this
    /// process has no worker to observe the request and is marked STOPPED
    /// directly. Both writes only land while the stored record is still
    /// running, so an execution that finishes meanwhile keeps its status.
    pub fn stop(&self, id: JobExecutionId) -> Result<JobExecution, BatchError> {
        self.running.flush_unsaved(self.store.as_ref());
        if self.running.unsaved(id).is_some() {
            return Err(BatchError::illegal_state(format!(
                "execution {id} has finished; its final status is not recorded yet"
            )));
        }
        let mut execution = self.load(id)?;
        if !execution.is_running() {
            return Err(already_finished(id, execution.status));
        }

        match self.running.get(id) {
            Some(token) => {
                execution.mark_stopping();
                self.save_if_running(&execution)?;
                token.request_stop();
                info!(execution_id = %id, "stop requested");
            }
            None => {
                warn!(execution_id = %id, "stop requested for execution with no local worker");
                execution.finish(BatchStatus::Stopped, ExitStatus::stopped());
                self.save_if_running(&execution)?;
                self.close_steps(id, BatchStatus::Stopped, ExitStatus::stopped())?;
            }
        }
        Ok(execution)
    }

    /// Mark a STOPPED or FAILED execution ABANDONED so it is never restarted.
    pub fn abandon(&self, id: JobExecutionId) -> Result<JobExecution, BatchError> {
        let mut execution = self.load(id)?;
        match execution.status {
            BatchStatus::Stopped | BatchStatus::Failed => {
                execution.status = BatchStatus::Abandoned;
                execution.last_updated = chrono::Utc::now();
                self.store.update_job_execution(&execution)?;
                info!(execution_id = %id, "execution abandoned");
                Ok(execution)
            }
            status => Err(BatchError::illegal_state(format!(
                "execution {id} is {status}; only STOPPED or FAILED executions can be abandoned"
            ))),
        }
    }

    /// Fail every execution the store records as running but that no worker
    /// in this process owns. Meant to run once at startup, before launching.
    ///
    /// Finished executions whose final save failed earlier are recorded with
    /// their real outcome instead.
    pub fn recover_orphans(&self) -> Result<Vec<JobExecutionId>, BatchError> {
        self.running.flush_unsaved(self.store.as_ref());
        let mut recovered = Vec::new();
        for mut execution in self.store.find_running_job_executions(None)? {
            if self.running.contains(execution.id) || self.running.unsaved(execution.id).is_some() {
                continue;
            }
            let exit = ExitStatus::failed().with_description(ORPHANED_DESCRIPTION);
            execution.finish(BatchStatus::Failed, exit.clone());
            if !self.store.update_job_execution_if_status(&execution, RUNNING)? {
                continue;
            }
            self.close_steps(execution.id, BatchStatus::Failed, exit)?;
            warn!(execution_id = %execution.id, job = %execution.job_name, "orphaned execution marked failed");
            recovered.push(execution.id);
        }
        Ok(recovered)
    }

    fn save_if_running(&self, execution: &JobExecution) -> Result<(), BatchError> {
        if self.store.update_job_execution_if_status(execution, RUNNING)? {
            return Ok(());
        }
        let current = self.load(execution.id)?;
        Err(already_finished(execution.id, current.status))
    }

    fn load(&self, id: JobExecutionId) -> Result<JobExecution, BatchError> {
        self.store
            .find_job_execution(id)?
            .ok_or_else(|| BatchError::not_found(format!("job execution {id}")))
    }

    fn close_steps(&self, id: JobExecutionId, status: BatchStatus, exit: ExitStatus) -> Result<(), BatchError> {
        for mut step in self.store.find_step_executions(id)? {
            if step.status.is_running() {
                step.finish(status, exit.clone());
                self.store.update_step_execution(&step)?;
            }
        }
        Ok(())
    }
}
