//! Drives one job execution through its steps.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, info_span, warn};

use batchforge_core::{BatchError, BatchStatus, ExitStatus, JobExecution, StepExecution};

use super::Job;
use crate::step::{Step, StepContext, StopToken};
use crate::store::{ExecutionStore, StoreError};

const FINAL_SAVE_ATTEMPTS: u32 = 3;
const FINAL_SAVE_BACKOFF: Duration = Duration::from_millis(20);

/// Runs the steps of a job sequentially, in declaration order.
///
/// Whatever happens inside steps and listeners (errors and panics alike), the
/// execution ends in a terminal status with a description of what went wrong.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn ExecutionStore>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    pub fn run(&self, job: &Job, execution: JobExecution, stop: &StopToken) -> JobExecution {
        self.run_and_report(job, execution, stop).0
    }

    /// Like [`run`](Self::run), also reporting whether the terminal record
    /// reached the store. On `Err` the store still shows the execution as
    /// running and the returned record is the only copy of its outcome.
    pub fn run_and_report(
        &self,
        job: &Job,
        mut execution: JobExecution,
        stop: &StopToken,
    ) -> (JobExecution, Result<(), StoreError>) {
        let span = info_span!("job", job = %job.name(), execution_id = %execution.id);
        let _entered = span.enter();

        execution.mark_started();
        if let Err(e) = self.store.update_job_execution(&execution) {
            error!(error = %e, "could not record job start");
            execution.finish(
                BatchStatus::Failed,
                ExitStatus::failed().with_description(format!("could not record job start: {e}")),
            );
            let saved = self.save_final(&execution);
            return (execution, saved);
        }
        info!(parameters = execution.parameters.len(), "job started");

        let mut notes = Vec::new();
        for listener in job.listeners() {
            if let Err(e) = guarded(|| listener.before_job(&execution).map_err(|e| e.to_string())) {
                warn!(error = %e, "before_job listener failed");
                notes.push(format!("before_job: {e}"));
            }
        }

        let (status, mut exit) = match self.run_steps(job, &mut execution, stop) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "job aborted");
                (BatchStatus::Failed, ExitStatus::failed().with_description(e.to_string()))
            }
        };

        execution.status = status;
        execution.exit_status = exit.clone();
        for listener in job.listeners() {
            if let Err(e) = guarded(|| listener.after_job(&execution).map_err(|e| e.to_string())) {
                warn!(error = %e, "after_job listener failed");
                notes.push(format!("after_job: {e}"));
            }
        }
        for note in &notes {
            exit = exit.add_description(note);
        }
        execution.finish(status, exit);

        let saved = self.save_final(&execution);
        info!(
            status = %execution.status,
            exit_code = %execution.exit_status.exit_code,
            steps = execution.step_executions.len(),
            recorded = saved.is_ok(),
            "job finished"
        );
        (execution, saved)
    }

    /// Save the terminal record, retrying a bounded number of times.
    fn save_final(&self, execution: &JobExecution) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.store.update_job_execution(execution) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < FINAL_SAVE_ATTEMPTS => {
                    warn!(attempt, error = %e, "could not record job end, retrying");
                    thread::sleep(FINAL_SAVE_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, status = %execution.status, "could not record job end");
                    return Err(e);
                }
            }
        }
    }

    fn run_steps(
        &self,
        job: &Job,
        execution: &mut JobExecution,
        stop: &StopToken,
    ) -> Result<(BatchStatus, ExitStatus), BatchError> {
        let mut status = BatchStatus::Completed;
        let mut exit = ExitStatus::completed();
        let mut ran = 0usize;

        for step in job.steps() {
            if stop.is_stop_requested() {
                info!(next_step = step.name(), "stop requested, not starting further steps");
                return Ok((
                    status.upgrade_to(BatchStatus::Stopped),
                    exit.and(ExitStatus::stopped().with_description("stop requested")),
                ));
            }

            let last = self.store.last_step_execution(execution.instance_id, step.name())?;
            if let Some(last) = &last {
                if last.status == BatchStatus::Completed && !step.allow_start_if_complete() {
                    info!(step = step.name(), "step already completed in this instance, skipping");
                    continue;
                }
            }

            let starts = self.store.step_execution_count(execution.instance_id, step.name())?;
            if starts >= step.start_limit() {
                let description = format!(
                    "restart rejected: step {} reached its start limit of {}",
                    step.name(),
                    step.start_limit()
                );
                warn!(step = step.name(), starts, "start limit exceeded");
                return Ok((
                    BatchStatus::Failed,
                    exit.and(ExitStatus::failed().with_description(description)),
                ));
            }

            let mut step_execution = self
                .store
                .create_step_execution(execution.id, step.name())?;
            if let Some(last) = last {
                if last.status != BatchStatus::Completed {
                    step_execution.execution_context = last.execution_context;
                }
            }

            self.execute_step(&**step, &mut step_execution, execution, stop)?;
            ran += 1;

            status = status.upgrade_to(step_execution.status);
            exit = exit.and(step_execution.exit_status.clone());
            let unsuccessful = step_execution.status != BatchStatus::Completed
                || step_execution.exit_status.exit_code == ExitStatus::FAILED_CODE;
            execution.step_executions.push(step_execution);

            if unsuccessful {
                if status == BatchStatus::Completed {
                    status = BatchStatus::Failed;
                }
                break;
            }
        }

        if ran == 0 && status == BatchStatus::Completed {
            exit = ExitStatus::noop().with_description("all steps already completed");
        }
        Ok((status, exit))
    }

    fn execute_step(
        &self,
        step: &dyn Step,
        step_execution: &mut StepExecution,
        execution: &JobExecution,
        stop: &StopToken,
    ) -> Result<(), BatchError> {
        let ctx = StepContext {
            job_execution: execution,
            store: self.store.as_ref(),
            stop,
        };
        let failure = match catch_unwind(AssertUnwindSafe(|| step.execute(step_execution, &ctx))) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("step panicked: {}", panic_message(panic.as_ref())),
        };

        error!(step = step.name(), error = %failure, "step aborted");
        let exit = std::mem::take(&mut step_execution.exit_status)
            .and(ExitStatus::failed().with_description(failure));
        step_execution.finish(BatchStatus::Failed, exit);
        self.store.update_step_execution(step_execution)?;
        Ok(())
    }
}

/// Run `f`, turning a panic into an error message.
fn guarded(f: impl FnOnce() -> Result<(), String>) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
