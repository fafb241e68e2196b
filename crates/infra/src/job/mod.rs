//! Job definitions and the job runner.

pub mod runner;

use std::collections::BTreeSet;
use std::sync::Arc;

use batchforge_core::{BatchError, JobExecution, JobParameters};

use crate::step::{ListenerError, Step};

pub use runner::JobRunner;

/// Checks parameters before anything is persisted.
pub trait JobParametersValidator: Send + Sync {
    fn validate(&self, params: &JobParameters) -> Result<(), BatchError>;
}

/// Required keys must be present. When optional keys are declared, any key
/// outside `required ∪ optional` is rejected as well.
#[derive(Debug, Clone, Default)]
pub struct DefaultJobParametersValidator {
    required_keys: BTreeSet<String>,
    optional_keys: BTreeSet<String>,
}

impl DefaultJobParametersValidator {
    pub fn new<R, O, S, T>(required: R, optional: O) -> Self
    where
        R: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            required_keys: required.into_iter().map(Into::into).collect(),
            optional_keys: optional.into_iter().map(Into::into).collect(),
        }
    }
}

impl JobParametersValidator for DefaultJobParametersValidator {
    fn validate(&self, params: &JobParameters) -> Result<(), BatchError> {
        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .filter(|key| !params.contains(key))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(BatchError::invalid_parameters(format!(
                "missing required keys: {}",
                missing.join(", ")
            )));
        }

        if !self.optional_keys.is_empty() {
            let unknown: Vec<&str> = params
                .iter()
                .map(|(name, _)| name)
                .filter(|name| {
                    !self.required_keys.contains(*name) && !self.optional_keys.contains(*name)
                })
                .collect();
            if !unknown.is_empty() {
                return Err(BatchError::invalid_parameters(format!(
                    "unexpected keys: {}",
                    unknown.join(", ")
                )));
            }
        }
        Ok(())
    }
}

impl<F> JobParametersValidator for F
where
    F: Fn(&JobParameters) -> Result<(), BatchError> + Send + Sync,
{
    fn validate(&self, params: &JobParameters) -> Result<(), BatchError> {
        self(params)
    }
}

pub trait JobExecutionListener: Send + Sync {
    fn before_job(&self, _execution: &JobExecution) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Sees the execution with its final status, before it is persisted.
    fn after_job(&self, _execution: &JobExecution) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// A named, ordered sequence of steps.
pub struct Job {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    restartable: bool,
    validator: Option<Arc<dyn JobParametersValidator>>,
    listeners: Vec<Arc<dyn JobExecutionListener>>,
}

impl core::fmt::Debug for Job {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("steps", &self.step_names().collect::<Vec<_>>())
            .field("restartable", &self.restartable)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            steps: Vec::new(),
            restartable: true,
            validator: None,
            listeners: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name())
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.step_names().any(|n| n == name)
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    pub fn listeners(&self) -> &[Arc<dyn JobExecutionListener>] {
        &self.listeners
    }

    pub fn validate(&self, params: &JobParameters) -> Result<(), BatchError> {
        match &self.validator {
            Some(validator) => validator.validate(params),
            None => Ok(()),
        }
    }
}

pub struct JobBuilder {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    restartable: bool,
    validator: Option<Arc<dyn JobParametersValidator>>,
    listeners: Vec<Arc<dyn JobExecutionListener>>,
}

impl JobBuilder {
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn validator(mut self, validator: impl JobParametersValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn listener(mut self, listener: impl JobExecutionListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// A job needs at least one step and step names must be unique.
    pub fn build(self) -> Result<Job, BatchError> {
        if self.steps.is_empty() {
            return Err(BatchError::illegal_state(format!("job {} has no steps", self.name)));
        }
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(BatchError::illegal_state(format!(
                    "job {} declares step {} twice",
                    self.name,
                    step.name()
                )));
            }
        }
        Ok(Job {
            name: self.name,
            steps: self.steps,
            restartable: self.restartable,
            validator: self.validator,
            listeners: self.listeners,
        })
    }
}
