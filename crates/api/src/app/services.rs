//! Engine wiring: execution store, launcher, explorer, operator and the
//! book catalogue, in-memory or Postgres-backed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use batchforge_books::{
    BookRepository, ImportBooksSettings, InMemoryBookRepository, PostgresBookRepository,
    import_books_job,
};
use batchforge_infra::job::Job;
use batchforge_infra::store::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore};
use batchforge_infra::{BatchConfig, JobExplorer, JobLauncher, JobOperator, ThreadPerTaskExecutor};

/// Everything the handlers need, shared behind an `Arc`.
pub struct AppServices {
    pub launcher: JobLauncher,
    pub explorer: JobExplorer,
    pub operator: JobOperator,
    pub books: Arc<dyn BookRepository>,
    pub import_job: Arc<Job>,
    pub upload_dir: PathBuf,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        books: Arc<dyn BookRepository>,
        config: &BatchConfig,
    ) -> anyhow::Result<Self> {
        let launcher = JobLauncher::new(store.clone(), Arc::new(ThreadPerTaskExecutor::new("import")));
        let operator = JobOperator::new(store.clone(), launcher.running());
        let settings = ImportBooksSettings {
            chunk: config.chunk_config(),
            ..ImportBooksSettings::default()
        };
        let import_job = Arc::new(import_books_job(books.clone(), settings)?);

        Ok(Self {
            launcher,
            explorer: JobExplorer::new(store),
            operator,
            books,
            import_job,
            upload_dir: config.upload_dir.clone(),
        })
    }

    /// Volatile stores; nothing survives the process.
    pub fn in_memory(config: &BatchConfig) -> anyhow::Result<Self> {
        Self::new(
            Arc::new(InMemoryExecutionStore::new()),
            Arc::new(InMemoryBookRepository::new()),
            config,
        )
    }
}

/// Build the services for `config` and fail any execution a previous
/// process left running.
pub async fn build_services(config: &BatchConfig) -> anyhow::Result<Arc<AppServices>> {
    let services = match (&config.database_url, config.use_persistent_stores) {
        (Some(url), true) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;

            let store = PostgresExecutionStore::new(pool.clone())?;
            store.ensure_schema().await?;
            let books = PostgresBookRepository::new(pool)?;
            books.ensure_schema().await?;
            tracing::info!("using Postgres stores");

            AppServices::new(Arc::new(store), Arc::new(books), config)?
        }
        _ => {
            tracing::info!("using in-memory stores");
            AppServices::in_memory(config)?
        }
    };

    let services = Arc::new(services);
    let recovery = services.clone();
    let recovered = tokio::task::spawn_blocking(move || recovery.operator.recover_orphans())
        .await
        .context("orphan recovery panicked")??;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), executions = ?recovered, "recovered orphaned executions");
    }
    Ok(services)
}
