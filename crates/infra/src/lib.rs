//! Infrastructure layer: execution store, item pipeline, chunk steps, job
//! running and launching, operator actions, config.

pub mod config;
pub mod explore;
pub mod item;
pub mod job;
pub mod launch;
pub mod operator;
pub mod step;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{BatchConfig, ConfigError};
pub use explore::JobExplorer;
pub use job::{Job, JobRunner};
pub use launch::{JobLauncher, SyncTaskExecutor, TaskExecutor, ThreadPerTaskExecutor};
pub use operator::JobOperator;
pub use store::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError};
