//! Read-only queries over batch metadata.

use std::sync::Arc;

use batchforge_core::{
    BatchError, ExecutionSummary, JobExecution, JobExecutionId, JobInstance, JobInstanceId,
    JobParameters, StepExecution,
};

use crate::store::ExecutionStore;

/// Status queries. Every method is a pure read; calling it any number of
/// times leaves the store untouched.
#[derive(Clone)]
pub struct JobExplorer {
    store: Arc<dyn ExecutionStore>,
}

impl JobExplorer {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Status view of one execution; `None` when the id is unknown.
    pub fn execution_summary(&self, id: JobExecutionId) -> Result<Option<ExecutionSummary>, BatchError> {
        Ok(self.store.find_job_execution(id)?.map(|e| e.summary()))
    }

    pub fn job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, BatchError> {
        Ok(self.store.find_job_execution(id)?)
    }

    /// Summary of the most recent execution of the instance identified by
    /// `job_name` and the identifying subset of `params`.
    pub fn latest_summary(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<Option<ExecutionSummary>, BatchError> {
        let Some(instance) = self.store.find_job_instance(job_name, params)? else {
            return Ok(None);
        };
        Ok(self.store.last_job_execution(instance.id)?.map(|e| e.summary()))
    }

    pub fn job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, BatchError> {
        Ok(self.store.get_job_instance(id)?)
    }

    /// Every execution of an instance, oldest first.
    pub fn job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, BatchError> {
        Ok(self.store.find_job_executions(instance_id)?)
    }

    pub fn step_executions(&self, id: JobExecutionId) -> Result<Vec<StepExecution>, BatchError> {
        Ok(self.store.find_step_executions(id)?)
    }

    pub fn running_executions(&self, job_name: Option<&str>) -> Result<Vec<JobExecution>, BatchError> {
        Ok(self.store.find_running_job_executions(job_name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchforge_core::{BatchStatus, ExitStatus};

    use crate::store::InMemoryExecutionStore;

    fn params(cid: &str) -> JobParameters {
        JobParameters::builder()
            .add_string("correlation-id", cid, true)
            .add_resource("file-path", "/tmp/books.csv", false)
            .build()
    }

    #[test]
    fn unknown_ids_yield_none() {
        let explorer = JobExplorer::new(Arc::new(InMemoryExecutionStore::new()));
        assert!(explorer.execution_summary(JobExecutionId::new(42)).unwrap().is_none());
        assert!(explorer.latest_summary("importBooksJob", &params("x")).unwrap().is_none());
        assert!(explorer.job_instance(JobInstanceId::new(1)).unwrap().is_none());
    }

    #[test]
    fn latest_summary_tracks_the_newest_execution() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let instance = store.create_job_instance("importBooksJob", &params("c-1")).unwrap();
        let mut first = store.create_job_execution(&instance, params("c-1")).unwrap();
        first.mark_started();
        first.finish(BatchStatus::Failed, ExitStatus::failed().with_description("boom"));
        store.update_job_execution(&first).unwrap();
        let second = store.create_job_execution(&instance, params("c-1")).unwrap();

        let explorer = JobExplorer::new(store);
        let latest = explorer.latest_summary("importBooksJob", &params("c-1")).unwrap().unwrap();
        assert_eq!(latest.execution_id, second.id);
        assert_eq!(latest.status, BatchStatus::Starting);

        let older = explorer.execution_summary(first.id).unwrap().unwrap();
        assert_eq!(older.status, BatchStatus::Failed);
        assert_eq!(older.exit_description, "boom");
        assert_eq!(explorer.job_executions(instance.id).unwrap().len(), 2);
        assert_eq!(explorer.running_executions(None).unwrap().len(), 1);
    }

    #[test]
    fn repeated_queries_do_not_change_the_record() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let instance = store.create_job_instance("importBooksJob", &params("c-2")).unwrap();
        let execution = store.create_job_execution(&instance, params("c-2")).unwrap();
        let explorer = JobExplorer::new(store.clone());

        let first = explorer.job_execution(execution.id).unwrap();
        for _ in 0..5 {
            explorer.execution_summary(execution.id).unwrap();
        }
        assert_eq!(explorer.job_execution(execution.id).unwrap(), first);
    }
}
