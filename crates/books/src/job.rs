//! The `importBooksJob` definition.

use std::sync::Arc;

use tracing::info;

use batchforge_core::{BatchError, ExitStatus, JobExecution, JobParameters, StepExecution};
use batchforge_infra::item::{FlatFileItemReader, ItemError};
use batchforge_infra::job::{DefaultJobParametersValidator, Job, JobExecutionListener};
use batchforge_infra::step::{ChunkConfig, ChunkStep, LimitedSkip, ListenerError, NeverSkip, StepExecutionListener};

use crate::book::{Book, BookEntity, BookProcessor, book_line_mapper};
use crate::repository::{BookRepository, BookWriter};

pub const IMPORT_BOOKS_JOB_NAME: &str = "importBooksJob";
pub const IMPORT_BOOKS_STEP_NAME: &str = "importBooksStart";
pub const CORRELATION_ID_PARAMETER: &str = "correlation-id";
pub const FILE_PATH_PARAMETER: &str = "file-path";

const READER_NAME: &str = "importBooksStartReader";

/// One reader name per upload, so the saved `read.count` of one correlation
/// id is never taken for another's.
pub fn reader_name(correlation_id: &str) -> String {
    format!("{READER_NAME}.{correlation_id}")
}

/// Tunables of the import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportBooksSettings {
    pub chunk: ChunkConfig,
    /// Bad rows tolerated per step execution. `0` fails on the first one.
    pub skip_limit: u64,
}

impl Default for ImportBooksSettings {
    fn default() -> Self {
        Self {
            chunk: ChunkConfig::default(),
            skip_limit: 0,
        }
    }
}

/// Launch parameters: the correlation id identifies the instance, the file
/// path does not.
pub fn import_parameters(correlation_id: &str, file_path: &str) -> JobParameters {
    JobParameters::builder()
        .add_string(CORRELATION_ID_PARAMETER, correlation_id, true)
        .add_resource(FILE_PATH_PARAMETER, file_path, false)
        .build()
}

/// Just the identifying part, for status lookups.
pub fn status_parameters(correlation_id: &str) -> JobParameters {
    JobParameters::builder()
        .add_string(CORRELATION_ID_PARAMETER, correlation_id, true)
        .build()
}

struct ImportLogListener;

impl JobExecutionListener for ImportLogListener {
    fn before_job(&self, execution: &JobExecution) -> Result<(), ListenerError> {
        info!(job = %execution.job_name, execution_id = %execution.id, start_time = ?execution.start_time, "import starting");
        Ok(())
    }

    fn after_job(&self, execution: &JobExecution) -> Result<(), ListenerError> {
        info!(
            job = %execution.job_name,
            execution_id = %execution.id,
            status = %execution.status,
            exit_description = %execution.exit_status.exit_description,
            "import finished"
        );
        Ok(())
    }
}

impl StepExecutionListener for ImportLogListener {
    fn before_step(&self, step: &StepExecution) -> Result<(), ListenerError> {
        info!(step = %step.step_name, start_time = %step.start_time, "step started");
        Ok(())
    }

    fn after_step(&self, step: &StepExecution) -> Result<Option<ExitStatus>, ListenerError> {
        info!(
            step = %step.step_name,
            read = step.read_count,
            written = step.write_count,
            skipped = step.skip_count(),
            "step finished"
        );
        Ok(None)
    }
}

/// `importBooksJob`: one chunk step reading the uploaded CSV (header
/// skipped), validating each row and saving chunks through `repository`.
pub fn import_books_job(
    repository: Arc<dyn BookRepository>,
    settings: ImportBooksSettings,
) -> Result<Job, BatchError> {
    let builder = ChunkStep::<Book, BookEntity>::builder(IMPORT_BOOKS_STEP_NAME, settings.chunk)
        .reader(|params: &JobParameters, _| {
            let path = params
                .get_string(FILE_PATH_PARAMETER)
                .ok_or_else(|| ItemError::read(format!("{FILE_PATH_PARAMETER} parameter missing")))?;
            let correlation_id = params
                .get_string(CORRELATION_ID_PARAMETER)
                .ok_or_else(|| ItemError::read(format!("{CORRELATION_ID_PARAMETER} parameter missing")))?;
            Ok(Box::new(
                FlatFileItemReader::new(reader_name(correlation_id), path, book_line_mapper())
                    .lines_to_skip(1)
                    .strict(true),
            ))
        })
        .processor(|_, _| Ok(Box::new(BookProcessor)))
        .writer(move |_, _| Ok(Box::new(BookWriter::new(repository.clone()))))
        .listener(ImportLogListener);

    let builder = match settings.skip_limit {
        0 => builder.skip_policy(NeverSkip),
        limit => builder.skip_policy(LimitedSkip::bad_records(limit)),
    };
    let step = builder.build()?;

    Job::builder(IMPORT_BOOKS_JOB_NAME)
        .step(step)
        .validator(DefaultJobParametersValidator::new(
            [CORRELATION_ID_PARAMETER, FILE_PATH_PARAMETER],
            Vec::<String>::new(),
        ))
        .listener(ImportLogListener)
        .build()
}
