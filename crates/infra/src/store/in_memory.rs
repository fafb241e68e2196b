use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use batchforge_core::{
    BatchStatus, JobExecution, JobExecutionId, JobInstance, JobInstanceId, JobParameters, StepExecution,
    StepExecutionId,
};

use super::{ExecutionStore, StoreError};

#[derive(Debug, Default)]
struct Inner {
    next_instance_id: u64,
    next_execution_id: u64,
    next_step_id: u64,
    instances: BTreeMap<JobInstanceId, JobInstance>,
    /// (job_name, identity_key) -> instance id; the uniqueness constraint.
    identities: HashMap<(String, String), JobInstanceId>,
    executions: BTreeMap<JobExecutionId, JobExecution>,
    steps: BTreeMap<StepExecutionId, StepExecution>,
}

impl Inner {
    fn steps_of(&self, job_execution_id: JobExecutionId) -> Vec<StepExecution> {
        self.steps
            .values()
            .filter(|s| s.job_execution_id == job_execution_id)
            .cloned()
            .collect()
    }

    fn with_steps(&self, execution: &JobExecution) -> JobExecution {
        let mut execution = execution.clone();
        execution.step_executions = self.steps_of(execution.id);
        execution
    }

    fn executions_of(&self, instance_id: JobInstanceId) -> impl Iterator<Item = &JobExecution> {
        self.executions
            .values()
            .filter(move |e| e.instance_id == instance_id)
    }

    fn steps_in_instance<'a>(
        &'a self,
        instance_id: JobInstanceId,
        step_name: &'a str,
    ) -> impl Iterator<Item = &'a StepExecution> + 'a {
        self.steps.values().filter(move |s| {
            s.step_name == step_name
                && self
                    .executions
                    .get(&s.job_execution_id)
                    .is_some_and(|e| e.instance_id == instance_id)
        })
    }
}

/// In-memory execution store.
///
/// Intended for tests/dev and single-process deployments without a database.
/// One lock guards every map so instance creation is atomic with its
/// uniqueness check.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    inner: RwLock<Inner>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn create_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, StoreError> {
        let identity = params.identity_key();
        let mut inner = self.write()?;
        let key = (job_name.to_string(), identity.clone());
        if inner.identities.contains_key(&key) {
            return Err(StoreError::DuplicateInstance {
                job_name: job_name.to_string(),
                identity,
            });
        }
        inner.next_instance_id += 1;
        let instance = JobInstance::new(JobInstanceId::new(inner.next_instance_id), job_name, params);
        inner.identities.insert(key, instance.id);
        inner.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    fn find_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<Option<JobInstance>, StoreError> {
        let inner = self.read()?;
        let key = (job_name.to_string(), params.identity_key());
        Ok(inner
            .identities
            .get(&key)
            .and_then(|id| inner.instances.get(id))
            .cloned())
    }

    fn get_job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        Ok(self.read()?.instances.get(&id).cloned())
    }

    fn create_job_execution(
        &self,
        instance: &JobInstance,
        params: JobParameters,
    ) -> Result<JobExecution, StoreError> {
        let mut inner = self.write()?;
        if !inner.instances.contains_key(&instance.id) {
            return Err(StoreError::NotFound(format!("job instance {}", instance.id)));
        }
        inner.next_execution_id += 1;
        let execution = JobExecution::new(
            JobExecutionId::new(inner.next_execution_id),
            instance,
            params,
        );
        inner.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let slot = inner
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::NotFound(format!("job execution {}", execution.id)))?;
        let mut snapshot = execution.clone();
        snapshot.step_executions.clear();
        *slot = snapshot;
        Ok(())
    }

    fn update_job_execution_if_status(
        &self,
        execution: &JobExecution,
        expected: &[BatchStatus],
    ) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let slot = inner
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::NotFound(format!("job execution {}", execution.id)))?;
        if !expected.contains(&slot.status) {
            return Ok(false);
        }
        let mut snapshot = execution.clone();
        snapshot.step_executions.clear();
        *slot = snapshot;
        Ok(true)
    }

    fn find_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, StoreError> {
        let inner = self.read()?;
        Ok(inner.executions.get(&id).map(|e| inner.with_steps(e)))
    }

    fn last_job_execution(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Option<JobExecution>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .executions_of(instance_id)
            .last()
            .map(|e| inner.with_steps(e)))
    }

    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .executions_of(instance_id)
            .map(|e| inner.with_steps(e))
            .collect())
    }

    fn find_running_job_executions(
        &self,
        job_name: Option<&str>,
    ) -> Result<Vec<JobExecution>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .executions
            .values()
            .filter(|e| e.is_running())
            .filter(|e| job_name.is_none_or(|name| e.job_name == name))
            .map(|e| inner.with_steps(e))
            .collect())
    }

    fn create_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
    ) -> Result<StepExecution, StoreError> {
        let mut inner = self.write()?;
        if !inner.executions.contains_key(&job_execution_id) {
            return Err(StoreError::NotFound(format!("job execution {job_execution_id}")));
        }
        inner.next_step_id += 1;
        let step = StepExecution::new(
            StepExecutionId::new(inner.next_step_id),
            job_execution_id,
            step_name,
        );
        inner.steps.insert(step.id, step.clone());
        Ok(step)
    }

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let slot = inner
            .steps
            .get_mut(&step.id)
            .ok_or_else(|| StoreError::NotFound(format!("step execution {}", step.id)))?;
        *slot = step.clone();
        Ok(())
    }

    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError> {
        Ok(self.read()?.steps_of(job_execution_id))
    }

    fn last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        let inner = self.read()?;
        Ok(inner.steps_in_instance(instance_id, step_name).last().cloned())
    }

    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<u32, StoreError> {
        let inner = self.read()?;
        let count = inner.steps_in_instance(instance_id, step_name).count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchforge_core::{BatchStatus, ChunkCounts, ExitStatus};

    fn params(cid: &str) -> JobParameters {
        JobParameters::builder()
            .add_string("correlation-id", cid, true)
            .add_resource("file-path", "/tmp/x.csv", false)
            .build()
    }

    #[test]
    fn instance_identity_ignores_non_identifying_parameters() {
        let store = InMemoryExecutionStore::new();
        let instance = store.create_job_instance("import", &params("a")).unwrap();

        let other_file = JobParameters::builder()
            .add_string("correlation-id", "a", true)
            .add_resource("file-path", "/tmp/other.csv", false)
            .build();
        let found = store.find_job_instance("import", &other_file).unwrap();
        assert_eq!(found.map(|i| i.id), Some(instance.id));

        assert!(store.find_job_instance("import", &params("b")).unwrap().is_none());
        assert!(store.find_job_instance("other-job", &params("a")).unwrap().is_none());
    }

    #[test]
    fn duplicate_instance_is_rejected() {
        let store = InMemoryExecutionStore::new();
        store.create_job_instance("import", &params("a")).unwrap();
        let err = store.create_job_instance("import", &params("a")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateInstance { .. }));
        // Same identity under another job name is a different instance.
        store.create_job_instance("export", &params("a")).unwrap();
    }

    #[test]
    fn executions_are_listed_oldest_first_and_last_is_newest() {
        let store = InMemoryExecutionStore::new();
        let instance = store.create_job_instance("import", &params("a")).unwrap();
        let first = store.create_job_execution(&instance, params("a")).unwrap();
        let second = store.create_job_execution(&instance, params("a")).unwrap();

        let all = store.find_job_executions(instance.id).unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert_eq!(store.last_job_execution(instance.id).unwrap().unwrap().id, second.id);
    }

    #[test]
    fn update_overwrites_snapshot_and_attaches_steps_on_read() {
        let store = InMemoryExecutionStore::new();
        let instance = store.create_job_instance("import", &params("a")).unwrap();
        let mut execution = store.create_job_execution(&instance, params("a")).unwrap();
        let mut step = store.create_step_execution(execution.id, "load").unwrap();

        step.apply_chunk(ChunkCounts { read: 3, written: 3, ..ChunkCounts::default() });
        store.update_step_execution(&step).unwrap();
        execution.mark_started();
        execution.execution_context.put("k", "v");
        store.update_job_execution(&execution).unwrap();

        let loaded = store.find_job_execution(execution.id).unwrap().unwrap();
        assert_eq!(loaded.status, BatchStatus::Started);
        assert_eq!(loaded.execution_context.get_str("k"), Some("v"));
        assert_eq!(loaded.step_executions.len(), 1);
        assert_eq!(loaded.step_executions[0].write_count, 3);
    }

    #[test]
    fn conditional_update_leaves_finished_executions_alone() {
        let store = InMemoryExecutionStore::new();
        let instance = store.create_job_instance("import", &params("a")).unwrap();
        let mut execution = store.create_job_execution(&instance, params("a")).unwrap();
        execution.mark_started();
        store.update_job_execution(&execution).unwrap();

        let mut stale = execution.clone();
        execution.finish(BatchStatus::Completed, ExitStatus::completed());
        store.update_job_execution(&execution).unwrap();

        stale.mark_stopping();
        let running = [BatchStatus::Starting, BatchStatus::Started];
        assert!(!store.update_job_execution_if_status(&stale, &running).unwrap());
        let stored = store.find_job_execution(execution.id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);

        assert!(store.update_job_execution_if_status(&stale, &[BatchStatus::Completed]).unwrap());
        let stored = store.find_job_execution(execution.id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Stopping);
    }

    #[test]
    fn running_executions_filter_by_status_and_job() {
        let store = InMemoryExecutionStore::new();
        let a = store.create_job_instance("import", &params("a")).unwrap();
        let b = store.create_job_instance("export", &params("b")).unwrap();
        let mut done = store.create_job_execution(&a, params("a")).unwrap();
        done.finish(BatchStatus::Completed, ExitStatus::completed());
        store.update_job_execution(&done).unwrap();
        let running = store.create_job_execution(&a, params("a")).unwrap();
        store.create_job_execution(&b, params("b")).unwrap();

        let import_running = store.find_running_job_executions(Some("import")).unwrap();
        assert_eq!(import_running.iter().map(|e| e.id).collect::<Vec<_>>(), vec![running.id]);
        assert_eq!(store.find_running_job_executions(None).unwrap().len(), 2);
    }

    #[test]
    fn step_history_spans_executions_of_the_instance() {
        let store = InMemoryExecutionStore::new();
        let instance = store.create_job_instance("import", &params("a")).unwrap();
        let first = store.create_job_execution(&instance, params("a")).unwrap();
        store.create_step_execution(first.id, "load").unwrap();
        let second = store.create_job_execution(&instance, params("a")).unwrap();
        let latest = store.create_step_execution(second.id, "load").unwrap();

        assert_eq!(store.step_execution_count(instance.id, "load").unwrap(), 2);
        assert_eq!(store.step_execution_count(instance.id, "other").unwrap(), 0);
        assert_eq!(
            store.last_step_execution(instance.id, "load").unwrap().map(|s| s.id),
            Some(latest.id)
        );
    }

    #[test]
    fn updating_unknown_records_fails() {
        let store = InMemoryExecutionStore::new();
        let instance = store.create_job_instance("import", &params("a")).unwrap();
        let execution = store.create_job_execution(&instance, params("a")).unwrap();
        let mut ghost = execution.clone();
        ghost.id = JobExecutionId::new(999);
        assert!(matches!(store.update_job_execution(&ghost), Err(StoreError::NotFound(_))));
        assert!(store.create_step_execution(ghost.id, "load").is_err());
    }
}
