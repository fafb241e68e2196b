//! Launching jobs: instance resolution, single-flight enforcement and
//! asynchronous dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

use batchforge_core::{
    BatchError, BatchStatus, ExecutionContext, ExitStatus, JobExecution, JobExecutionId,
    JobInstance, JobParameters,
};

use crate::job::{Job, JobRunner};
use crate::step::StopToken;
use crate::store::ExecutionStore;

/// A unit of work handed to a [`TaskExecutor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("task rejected: {0}")]
pub struct TaskRejected(pub String);

/// Where launched executions run.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, name: String, task: Task) -> Result<(), TaskRejected>;
}

/// One named OS thread per task; unbounded.
#[derive(Debug, Clone)]
pub struct ThreadPerTaskExecutor {
    thread_name_prefix: String,
}

impl ThreadPerTaskExecutor {
    pub fn new(thread_name_prefix: impl Into<String>) -> Self {
        Self {
            thread_name_prefix: thread_name_prefix.into(),
        }
    }
}

impl Default for ThreadPerTaskExecutor {
    fn default() -> Self {
        Self::new("batch")
    }
}

impl TaskExecutor for ThreadPerTaskExecutor {
    fn execute(&self, name: String, task: Task) -> Result<(), TaskRejected> {
        thread::Builder::new()
            .name(format!("{}-{name}", self.thread_name_prefix))
            .spawn(task)
            .map(|_| ())
            .map_err(|e| TaskRejected(format!("could not spawn worker thread: {e}")))
    }
}

/// Runs the task on the caller's thread; `run` returns a finished execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncTaskExecutor;

impl TaskExecutor for SyncTaskExecutor {
    fn execute(&self, _name: String, task: Task) -> Result<(), TaskRejected> {
        task();
        Ok(())
    }
}

/// Stop tokens of the executions running in this process, plus finished
/// executions whose terminal record the store has not accepted yet.
#[derive(Debug, Default)]
pub struct RunningExecutions {
    tokens: Mutex<HashMap<JobExecutionId, StopToken>>,
    unsaved: Mutex<HashMap<JobExecutionId, JobExecution>>,
}

impl RunningExecutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: JobExecutionId, token: StopToken) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(id, token);
        }
    }

    pub fn remove(&self, id: JobExecutionId) -> Option<StopToken> {
        self.tokens.lock().ok().and_then(|mut tokens| tokens.remove(&id))
    }

    pub fn get(&self, id: JobExecutionId) -> Option<StopToken> {
        self.tokens.lock().ok().and_then(|tokens| tokens.get(&id).cloned())
    }

    pub fn contains(&self, id: JobExecutionId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep a finished execution whose final save failed until a later
    /// [`flush_unsaved`](Self::flush_unsaved) gets it into the store.
    pub fn park_unsaved(&self, execution: JobExecution) {
        if let Ok(mut unsaved) = self.unsaved.lock() {
            unsaved.insert(execution.id, execution);
        }
    }

    /// The parked terminal record of `id`, if its save is still pending.
    pub fn unsaved(&self, id: JobExecutionId) -> Option<JobExecution> {
        self.unsaved.lock().ok().and_then(|unsaved| unsaved.get(&id).cloned())
    }

    /// Retry the save of every parked record. Returns the ids now stored;
    /// records that fail again stay parked.
    pub fn flush_unsaved(&self, store: &dyn ExecutionStore) -> Vec<JobExecutionId> {
        let Ok(mut unsaved) = self.unsaved.lock() else {
            return Vec::new();
        };
        let mut flushed = Vec::new();
        unsaved.retain(|id, execution| match store.update_job_execution(execution) {
            Ok(()) => {
                info!(execution_id = %id, status = %execution.status, "recorded deferred job end");
                flushed.push(*id);
                false
            }
            Err(e) => {
                warn!(execution_id = %id, error = %e, "job end still not recorded");
                true
            }
        });
        flushed
    }
}

/// Public entry point for running jobs.
///
/// `run` validates parameters, resolves the job instance, refuses to start a
/// second execution of an instance that is running or already complete,
/// creates the new execution in STARTING and hands it to the task executor.
/// It returns as soon as the execution is dispatched; callers poll for the
/// outcome.
pub struct JobLauncher {
    store: Arc<dyn ExecutionStore>,
    executor: Arc<dyn TaskExecutor>,
    running: Arc<RunningExecutions>,
    launch_lock: Mutex<()>,
}

impl JobLauncher {
    pub fn new(store: Arc<dyn ExecutionStore>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            store,
            executor,
            running: Arc::new(RunningExecutions::new()),
            launch_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        self.store.clone()
    }

    pub fn running(&self) -> Arc<RunningExecutions> {
        self.running.clone()
    }

    pub fn run(&self, job: Arc<Job>, params: JobParameters) -> Result<JobExecution, BatchError> {
        job.validate(&params)?;

        let execution = {
            let _guard = self
                .launch_lock
                .lock()
                .map_err(|_| BatchError::illegal_state("launch lock poisoned"))?;
            self.running.flush_unsaved(self.store.as_ref());
            self.prepare_execution(&job, params)?
        };
        let id = execution.id;
        info!(job = %job.name(), execution_id = %id, instance_id = %execution.instance_id, "job launched");

        let token = StopToken::new();
        self.running.register(id, token.clone());

        let runner = JobRunner::new(self.store.clone());
        let running = self.running.clone();
        let task_job = job.clone();
        let task_execution = execution.clone();
        let task: Task = Box::new(move || {
            let (finished, saved) = runner.run_and_report(&task_job, task_execution, &token);
            if saved.is_err() {
                running.park_unsaved(finished);
            }
            running.remove(id);
        });

        if let Err(rejected) = self.executor.execute(format!("{}-{id}", job.name()), task) {
            warn!(job = %job.name(), execution_id = %id, error = %rejected, "dispatch failed");
            self.running.remove(id);
            let mut failed = execution;
            failed.finish(
                BatchStatus::Failed,
                ExitStatus::failed().with_description(rejected.to_string()),
            );
            self.store.update_job_execution(&failed)?;
            return Err(BatchError::illegal_state(format!(
                "execution {id} could not be dispatched: {rejected}"
            )));
        }

        if let Some(parked) = self.running.unsaved(id) {
            return Ok(parked);
        }
        Ok(self.store.find_job_execution(id)?.unwrap_or(execution))
    }

    /// Resolve the instance and create the execution. Runs under the launch lock.
    fn prepare_execution(&self, job: &Job, params: JobParameters) -> Result<JobExecution, BatchError> {
        let (instance, run_params, context) = match self.store.find_job_instance(job.name(), &params)? {
            None => {
                let instance = self.store.create_job_instance(job.name(), &params)?;
                (instance, params, ExecutionContext::new())
            }
            Some(instance) => match self.store.last_job_execution(instance.id)? {
                None => (instance, params, ExecutionContext::new()),
                Some(last) => self.restart_from(job, instance, &last, params)?,
            },
        };

        let mut execution = self.store.create_job_execution(&instance, run_params)?;
        if !context.is_empty() {
            execution.execution_context = context;
            self.store.update_job_execution(&execution)?;
        }
        Ok(execution)
    }

    fn restart_from(
        &self,
        job: &Job,
        instance: JobInstance,
        last: &JobExecution,
        params: JobParameters,
    ) -> Result<(JobInstance, JobParameters, ExecutionContext), BatchError> {
        if last.status.is_running() {
            return Err(BatchError::ExecutionAlreadyRunning(last.id.get()));
        }
        match last.status {
            BatchStatus::Completed => {
                return Err(BatchError::InstanceAlreadyComplete {
                    job_name: instance.job_name,
                    identity: instance.identity_key,
                });
            }
            status if !status.is_restartable() => {
                return Err(BatchError::restart_invalid(format!(
                    "last execution {} of {} is {status}",
                    last.id, instance.job_name
                )));
            }
            _ => {}
        }

        if !job.is_restartable() {
            return Err(BatchError::restart_invalid(format!(
                "job {} is not restartable",
                job.name()
            )));
        }
        if !params.contains_identity_of(&last.parameters) {
            return Err(BatchError::restart_invalid(
                "identifying parameters differ from the original execution",
            ));
        }
        for previous in self.store.find_job_executions(instance.id)? {
            for step in self.store.find_step_executions(previous.id)? {
                if !job.has_step(&step.step_name) {
                    return Err(BatchError::restart_invalid(format!(
                        "step {} ran in execution {} but is no longer part of job {}",
                        step.step_name,
                        previous.id,
                        job.name()
                    )));
                }
            }
        }

        info!(job = %job.name(), instance_id = %instance.id, previous_execution = %last.id, "restarting instance");
        let merged = last.parameters.merged_with(&params);
        Ok((instance, merged, last.execution_context.clone()))
    }
}
