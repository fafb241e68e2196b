//! Job instances, job executions and step executions.
//!
//! These records are plain state with transition helpers; the runner and the
//! chunk executor decide *when* to transition, the execution store decides
//! how they are persisted. Every save is a full snapshot of the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::id::{JobExecutionId, JobInstanceId, StepExecutionId};
use crate::parameters::JobParameters;
use crate::status::{BatchStatus, ExitStatus};

/// Unique logical run identity: job name + identifying parameters.
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
    /// Hex SHA-256 of the canonical identifying parameters.
    pub identity_key: String,
    pub created_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn new(id: JobInstanceId, job_name: impl Into<String>, parameters: &JobParameters) -> Self {
        Self {
            id,
            job_name: job_name.into(),
            identity_key: parameters.identity_key(),
            created_at: Utc::now(),
        }
    }
}

/// One attempt at running a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub instance_id: JobInstanceId,
    pub job_name: String,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub execution_context: ExecutionContext,
    /// Step executions of this attempt, in the order they ran.
    #[serde(default)]
    pub step_executions: Vec<StepExecution>,
}

impl JobExecution {
    /// A freshly created execution in STARTING.
    pub fn new(id: JobExecutionId, instance: &JobInstance, parameters: JobParameters) -> Self {
        let now = Utc::now();
        Self {
            id,
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time: now,
            start_time: None,
            end_time: None,
            last_updated: now,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn mark_started(&mut self) {
        let now = Utc::now();
        self.status = BatchStatus::Started;
        self.exit_status = ExitStatus::executing();
        self.start_time = Some(now);
        self.last_updated = now;
    }

    pub fn mark_stopping(&mut self) {
        self.status = BatchStatus::Stopping;
        self.last_updated = Utc::now();
    }

    /// Move to a terminal status and stamp the end time.
    pub fn finish(&mut self, status: BatchStatus, exit_status: ExitStatus) {
        let now = Utc::now();
        self.status = status;
        self.exit_status = exit_status;
        self.end_time = Some(now);
        self.last_updated = now;
    }

    /// Record a failure description without changing the exit code.
    pub fn add_failure(&mut self, description: impl AsRef<str>) {
        let exit = std::mem::take(&mut self.exit_status);
        self.exit_status = exit.add_description(description);
        self.last_updated = Utc::now();
    }

    /// Status-query view of this execution.
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            instance_id: self.instance_id,
            execution_id: self.id,
            job_name: self.job_name.clone(),
            create_time: self.create_time,
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
            exit_code: self.exit_status.exit_code.clone(),
            exit_description: self.exit_status.exit_description.clone(),
        }
    }
}

/// One attempt at running one step within a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub execution_context: ExecutionContext,
}

/// Counter deltas produced by one committed chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCounts {
    pub read: u64,
    pub written: u64,
    pub filtered: u64,
    pub read_skips: u64,
    pub process_skips: u64,
}

impl StepExecution {
    pub fn new(id: StepExecutionId, job_execution_id: JobExecutionId, step_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            commit_count: 0,
            rollback_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            start_time: now,
            end_time: None,
            last_updated: now,
            execution_context: ExecutionContext::new(),
        }
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn mark_started(&mut self) {
        self.status = BatchStatus::Started;
        self.last_updated = Utc::now();
    }

    /// Fold a committed chunk into the counters. Counters only ever grow.
    pub fn apply_chunk(&mut self, counts: ChunkCounts) {
        self.read_count += counts.read;
        self.write_count += counts.written;
        self.filter_count += counts.filtered;
        self.read_skip_count += counts.read_skips;
        self.process_skip_count += counts.process_skips;
        self.commit_count += 1;
        self.last_updated = Utc::now();
    }

    pub fn mark_rolled_back(&mut self) {
        self.rollback_count += 1;
        self.last_updated = Utc::now();
    }

    pub fn finish(&mut self, status: BatchStatus, exit_status: ExitStatus) {
        let now = Utc::now();
        self.status = status;
        self.exit_status = exit_status;
        self.end_time = Some(now);
        self.last_updated = now;
    }
}

/// Outward status-query shape for one job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub instance_id: JobInstanceId,
    pub execution_id: JobExecutionId,
    pub job_name: String,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub exit_code: String,
    pub exit_description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> JobInstance {
        let params = JobParameters::builder()
            .add_string("correlation-id", "c-1", true)
            .build();
        JobInstance::new(JobInstanceId::new(1), "importBooksJob", &params)
    }

    #[test]
    fn job_execution_lifecycle() {
        let instance = instance();
        let mut execution = JobExecution::new(JobExecutionId::new(7), &instance, JobParameters::empty());
        assert_eq!(execution.status, BatchStatus::Starting);
        assert!(execution.is_running());
        assert!(execution.start_time.is_none());

        execution.mark_started();
        assert_eq!(execution.status, BatchStatus::Started);
        assert!(execution.start_time.is_some());

        execution.finish(BatchStatus::Completed, ExitStatus::completed());
        assert!(!execution.is_running());
        assert!(execution.end_time.is_some());

        let summary = execution.summary();
        assert_eq!(summary.execution_id, JobExecutionId::new(7));
        assert_eq!(summary.instance_id, instance.id);
        assert_eq!(summary.status, BatchStatus::Completed);
        assert_eq!(summary.exit_code, "COMPLETED");
    }

    #[test]
    fn add_failure_keeps_exit_code() {
        let mut execution = JobExecution::new(JobExecutionId::new(1), &instance(), JobParameters::empty());
        execution.finish(BatchStatus::Failed, ExitStatus::failed());
        execution.add_failure("listener blew up");
        assert_eq!(execution.exit_status.exit_code, "FAILED");
        assert_eq!(execution.exit_status.exit_description, "listener blew up");
    }

    #[test]
    fn step_counters_accumulate_per_chunk() {
        let mut step = StepExecution::new(StepExecutionId::new(1), JobExecutionId::new(1), "load");
        step.apply_chunk(ChunkCounts {
            read: 100,
            written: 98,
            filtered: 1,
            read_skips: 0,
            process_skips: 1,
        });
        step.apply_chunk(ChunkCounts {
            read: 3,
            written: 3,
            ..ChunkCounts::default()
        });
        step.mark_rolled_back();

        assert_eq!(step.read_count, 103);
        assert_eq!(step.write_count, 101);
        assert_eq!(step.commit_count, 2);
        assert_eq!(step.rollback_count, 1);
        assert_eq!(step.skip_count(), 1);
    }
}
