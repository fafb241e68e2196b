//! Test store that fails selected writes on demand.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use batchforge_core::{
    BatchStatus, JobExecution, JobExecutionId, JobInstance, JobInstanceId, JobParameters,
    StepExecution,
};

use super::{ExecutionStore, InMemoryExecutionStore, StoreError};

type AfterFind = Box<dyn FnOnce(&InMemoryExecutionStore, JobExecutionId) + Send>;

/// [`InMemoryExecutionStore`] with switchable failures.
#[derive(Default)]
pub(crate) struct FlakyStore {
    pub inner: InMemoryExecutionStore,
    step_updates: AtomicUsize,
    fail_step_update: AtomicUsize,
    fail_job_updates: AtomicBool,
    after_find: Mutex<Option<AfterFind>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `nth` (1-based) call to `update_step_execution`, once.
    pub fn fail_step_update(&self, nth: usize) {
        self.fail_step_update.store(nth, Ordering::SeqCst);
    }

    /// Fail every job execution update until switched off.
    pub fn fail_job_updates(&self, fail: bool) {
        self.fail_job_updates.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` against the backing store right after the next
    /// `find_job_execution` has read its record.
    pub fn after_next_find(&self, hook: impl FnOnce(&InMemoryExecutionStore, JobExecutionId) + Send + 'static) {
        if let Ok(mut slot) = self.after_find.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    fn job_update_allowed(&self) -> Result<(), StoreError> {
        if self.fail_job_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("connection reset".to_string()));
        }
        Ok(())
    }
}

impl ExecutionStore for FlakyStore {
    fn create_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, StoreError> {
        self.inner.create_job_instance(job_name, params)
    }

    fn find_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<Option<JobInstance>, StoreError> {
        self.inner.find_job_instance(job_name, params)
    }

    fn get_job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        self.inner.get_job_instance(id)
    }

    fn create_job_execution(
        &self,
        instance: &JobInstance,
        params: JobParameters,
    ) -> Result<JobExecution, StoreError> {
        self.inner.create_job_execution(instance, params)
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        self.job_update_allowed()?;
        self.inner.update_job_execution(execution)
    }

    fn update_job_execution_if_status(
        &self,
        execution: &JobExecution,
        expected: &[BatchStatus],
    ) -> Result<bool, StoreError> {
        self.job_update_allowed()?;
        self.inner.update_job_execution_if_status(execution, expected)
    }

    fn find_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, StoreError> {
        let found = self.inner.find_job_execution(id)?;
        let hook = self.after_find.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook(&self.inner, id);
        }
        Ok(found)
    }

    fn last_job_execution(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Option<JobExecution>, StoreError> {
        self.inner.last_job_execution(instance_id)
    }

    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, StoreError> {
        self.inner.find_job_executions(instance_id)
    }

    fn find_running_job_executions(
        &self,
        job_name: Option<&str>,
    ) -> Result<Vec<JobExecution>, StoreError> {
        self.inner.find_running_job_executions(job_name)
    }

    fn create_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
    ) -> Result<StepExecution, StoreError> {
        self.inner.create_step_execution(job_execution_id, step_name)
    }

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), StoreError> {
        let call = self.step_updates.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_step_update.load(Ordering::SeqCst) {
            return Err(StoreError::Storage(format!("step update {call} lost")));
        }
        self.inner.update_step_execution(step)
    }

    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError> {
        self.inner.find_step_executions(job_execution_id)
    }

    fn last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        self.inner.last_step_execution(instance_id, step_name)
    }

    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<u32, StoreError> {
        self.inner.step_execution_count(instance_id, step_name)
    }
}
