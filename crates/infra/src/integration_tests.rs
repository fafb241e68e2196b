//! End-to-end tests: launcher → runner → chunk step → execution store.
//!
//! Verifies:
//! - A file-backed job runs to completion on a worker thread and is observed by polling
//! - A failed run restarts on the same instance and resumes after the last commit
//! - Bad records are skipped within the limit and counted
//! - A stop request ends the run at a chunk boundary as STOPPED
//! - Orphaned executions are recovered so their instance can restart
//! - The Postgres store honours the same contract (only when `DATABASE_URL` is set)

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use batchforge_core::{BatchError, BatchStatus, JobExecution, JobExecutionId, JobParameters};
    use tempfile::NamedTempFile;

    use crate::explore::JobExplorer;
    use crate::item::{
        Chunk, DefaultLineMapper, DelimitedLineTokenizer, FieldSet, FlatFileItemReader, FnItemProcessor,
        FnItemWriter, ItemError, VecItemWriter,
    };
    use crate::job::{DefaultJobParametersValidator, Job};
    use crate::launch::{JobLauncher, ThreadPerTaskExecutor};
    use crate::operator::{JobOperator, ORPHANED_DESCRIPTION};
    use crate::step::{ChunkConfig, ChunkStep, LimitedSkip};
    use crate::store::{ExecutionStore, InMemoryExecutionStore};

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: i64,
        name: String,
    }

    fn row_mapper() -> DefaultLineMapper<Row> {
        DefaultLineMapper::new(
            DelimitedLineTokenizer::new(["ID", "NAME"]).strict(true),
            |fields: &FieldSet| {
                Ok(Row {
                    id: fields.read_int("ID")?,
                    name: fields.read_trimmed("NAME")?.to_string(),
                })
            },
        )
    }

    fn csv_file(rows: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ID,NAME").unwrap();
        for i in 1..=rows {
            writeln!(file, "{i},row {i}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn params(cid: &str, path: &Path) -> JobParameters {
        JobParameters::builder()
            .add_string("correlation-id", cid, true)
            .add_resource("file-path", path.display().to_string(), false)
            .build()
    }

    fn file_job(
        chunk_size: usize,
        writer: impl Fn(&Chunk<Row>) -> Result<(), ItemError> + Clone + Send + Sync + 'static,
    ) -> Arc<Job> {
        let step = ChunkStep::<Row, Row>::builder("load", ChunkConfig::new(chunk_size))
            .reader(|params: &JobParameters, _| {
                let path = params
                    .get_string("file-path")
                    .ok_or_else(|| ItemError::read("file-path missing"))?;
                Ok(Box::new(FlatFileItemReader::new("rows", path, row_mapper()).lines_to_skip(1)))
            })
            .processor(|_, _| {
                Ok(Box::new(FnItemProcessor::new(|row: Row| {
                    if row.name.is_empty() {
                        Err(ItemError::validation(format!("row {} has no name", row.id)))
                    } else {
                        Ok(Some(row))
                    }
                })))
            })
            .writer(move |_, _| {
                let writer = writer.clone();
                Ok(Box::new(FnItemWriter::new(move |chunk: &Chunk<Row>| writer(chunk))))
            })
            .skip_policy(LimitedSkip::bad_records(5))
            .build()
            .unwrap();
        Arc::new(
            Job::builder("rowsJob")
                .step(step)
                .validator(DefaultJobParametersValidator::new(
                    ["correlation-id", "file-path"],
                    Vec::<String>::new(),
                ))
                .build()
                .unwrap(),
        )
    }

    fn threaded(store: Arc<dyn ExecutionStore>) -> JobLauncher {
        JobLauncher::new(store, Arc::new(ThreadPerTaskExecutor::new("it")))
    }

    fn wait_until_finished(explorer: &JobExplorer, id: JobExecutionId) -> JobExecution {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let execution = explorer.job_execution(id).unwrap().unwrap();
            if !execution.is_running() || Instant::now() > deadline {
                return execution;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn file_import_completes_asynchronously() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let launcher = threaded(store.clone());
        let explorer = JobExplorer::new(store.clone());
        let file = csv_file(250);
        let written = VecItemWriter::<Row>::new();
        let sink = written.clone();

        let launched = launcher
            .run(
                file_job(100, move |chunk| {
                    let mut sink = sink.clone();
                    crate::item::ItemWriter::write(&mut sink, chunk)?;
                    crate::item::ItemWriter::commit(&mut sink)
                }),
                params("c-1", file.path()),
            )
            .unwrap();
        assert!(launched.is_running() || launched.status == BatchStatus::Completed);

        let finished = wait_until_finished(&explorer, launched.id);
        assert_eq!(finished.status, BatchStatus::Completed);
        assert_eq!(finished.exit_status.exit_code, "COMPLETED");

        let step = &finished.step_executions[0];
        assert_eq!(step.read_count, 250);
        assert_eq!(step.write_count, 250);
        assert_eq!(step.commit_count, 3);
        assert_eq!(written.chunks().iter().map(Vec::len).collect::<Vec<_>>(), vec![100, 100, 50]);
        assert_eq!(written.items()[0], Row { id: 1, name: "row 1".to_string() });

        // Polling is a pure read.
        let again = explorer.execution_summary(launched.id).unwrap().unwrap();
        assert_eq!(again, finished.summary());
    }

    #[test]
    fn restart_after_failure_resumes_from_last_commit() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let launcher = threaded(store.clone());
        let explorer = JobExplorer::new(store.clone());
        let file = csv_file(300);

        let broken = Arc::new(AtomicBool::new(true));
        let seen = Arc::new(Mutex::new(Vec::<i64>::new()));
        let (broken_in_job, seen_in_job) = (broken.clone(), seen.clone());
        let job = file_job(100, move |chunk| {
            if broken_in_job.load(Ordering::SeqCst) && chunk.iter().any(|r| r.id == 250) {
                return Err(ItemError::write("duplicate key"));
            }
            let mut seen = seen_in_job.lock().map_err(|_| ItemError::write("poisoned"))?;
            seen.extend(chunk.iter().map(|r| r.id));
            Ok(())
        });

        let first = launcher.run(job.clone(), params("c-2", file.path())).unwrap();
        let first = wait_until_finished(&explorer, first.id);
        assert_eq!(first.status, BatchStatus::Failed);
        assert!(first.exit_status.exit_description.contains("duplicate key"));
        let failed_step = &first.step_executions[0];
        assert_eq!(failed_step.write_count, 200);
        assert_eq!(failed_step.commit_count, 2);
        assert_eq!(failed_step.rollback_count, 1);

        broken.store(false, Ordering::SeqCst);
        let second = launcher.run(job.clone(), params("c-2", file.path())).unwrap();
        assert_eq!(second.instance_id, first.instance_id);
        let second = wait_until_finished(&explorer, second.id);
        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(second.step_executions[0].read_count, 100);
        assert_eq!(second.step_executions[0].write_count, 100);

        let ids = seen.lock().unwrap().clone();
        assert_eq!(ids, (1..=300).collect::<Vec<i64>>());

        let err = launcher.run(job, params("c-2", file.path())).unwrap_err();
        assert!(matches!(err, BatchError::InstanceAlreadyComplete { .. }));
    }

    #[test]
    fn bad_records_are_skipped_and_counted() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let launcher = threaded(store.clone());
        let explorer = JobExplorer::new(store.clone());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ID,NAME").unwrap();
        writeln!(file, "1,alpha").unwrap();
        writeln!(file, "two,beta").unwrap();
        writeln!(file, "3,").unwrap();
        writeln!(file, "4,delta,extra").unwrap();
        writeln!(file, "5,\"epsilon, the fifth\"").unwrap();
        file.flush().unwrap();

        let launched = launcher
            .run(file_job(10, |_| Ok(())), params("c-3", file.path()))
            .unwrap();
        let finished = wait_until_finished(&explorer, launched.id);
        assert_eq!(finished.status, BatchStatus::Completed);

        let step = &finished.step_executions[0];
        assert_eq!(step.write_count, 2);
        assert_eq!(step.read_skip_count, 2);
        assert_eq!(step.process_skip_count, 1);
        assert_eq!(step.skip_count(), 3);
    }

    #[test]
    fn stop_request_ends_run_at_chunk_boundary() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let launcher = threaded(store.clone());
        let explorer = JobExplorer::new(store.clone());
        let operator = JobOperator::new(store.clone(), launcher.running());
        let file = csv_file(50);

        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let gate_in_job = gate.clone();
        let launched = launcher
            .run(
                file_job(10, move |_| {
                    let _ = entered_tx.send(());
                    let _open = gate_in_job.lock().map_err(|_| ItemError::write("poisoned"))?;
                    Ok(())
                }),
                params("c-4", file.path()),
            )
            .unwrap();

        // First chunk is inside the writer.
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let stopping = operator.stop(launched.id).unwrap();
        assert_eq!(stopping.status, BatchStatus::Stopping);
        drop(held);

        let finished = wait_until_finished(&explorer, launched.id);
        assert_eq!(finished.status, BatchStatus::Stopped);
        assert_eq!(finished.exit_status.exit_code, "STOPPED");
        let step = &finished.step_executions[0];
        assert_eq!(step.status, BatchStatus::Stopped);
        assert_eq!(step.write_count, 10);
        assert_eq!(step.commit_count, 1);
    }

    #[test]
    fn orphaned_execution_can_be_restarted_after_recovery() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let file = csv_file(5);
        let p = params("c-5", file.path());

        // Left behind by a process that died mid-run.
        let instance = store.create_job_instance("rowsJob", &p).unwrap();
        let mut dead = store.create_job_execution(&instance, p.clone()).unwrap();
        dead.mark_started();
        store.update_job_execution(&dead).unwrap();

        let launcher = threaded(store.clone());
        let err = launcher.run(file_job(10, |_| Ok(())), p.clone()).unwrap_err();
        assert!(matches!(err, BatchError::ExecutionAlreadyRunning(id) if id == dead.id.get()));

        let operator = JobOperator::new(store.clone(), launcher.running());
        assert_eq!(operator.recover_orphans().unwrap(), vec![dead.id]);
        let dead = store.find_job_execution(dead.id).unwrap().unwrap();
        assert_eq!(dead.exit_status.exit_description, ORPHANED_DESCRIPTION);

        let relaunched = launcher.run(file_job(10, |_| Ok(())), p).unwrap();
        assert_eq!(relaunched.instance_id, instance.id);
        let finished = wait_until_finished(&JobExplorer::new(store), relaunched.id);
        assert_eq!(finished.status, BatchStatus::Completed);
    }

    mod postgres {
        use super::*;
        use sqlx::postgres::PgPoolOptions;
        use tokio::runtime::Runtime;

        use crate::store::{PostgresExecutionStore, StoreError};

        fn store() -> Option<(Runtime, Arc<PostgresExecutionStore>)> {
            let url = std::env::var("DATABASE_URL").ok()?;
            let runtime = Runtime::new().unwrap();
            let pool = runtime
                .block_on(PgPoolOptions::new().max_connections(4).connect(&url))
                .unwrap();
            let store = PostgresExecutionStore::with_handle(pool, runtime.handle().clone());
            runtime.block_on(store.ensure_schema()).unwrap();
            Some((runtime, Arc::new(store)))
        }

        fn unique(prefix: &str) -> String {
            format!("{prefix}-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
        }

        #[test]
        fn duplicate_identity_is_rejected_by_the_database() {
            let Some((_runtime, store)) = store() else {
                return;
            };
            let p = JobParameters::builder().add_string("correlation-id", unique("dup"), true).build();
            store.create_job_instance("rowsJob", &p).unwrap();
            let err = store.create_job_instance("rowsJob", &p).unwrap_err();
            assert!(matches!(err, StoreError::DuplicateInstance { .. }));
        }

        #[test]
        fn file_import_round_trips_through_postgres() {
            let Some((_runtime, store)) = store() else {
                return;
            };
            let store: Arc<dyn ExecutionStore> = store;
            let launcher = threaded(store.clone());
            let explorer = JobExplorer::new(store.clone());
            let file = csv_file(120);

            let launched = launcher
                .run(file_job(50, |_| Ok(())), params(&unique("pg"), file.path()))
                .unwrap();
            let finished = wait_until_finished(&explorer, launched.id);
            assert_eq!(finished.status, BatchStatus::Completed);

            let steps = explorer.step_executions(launched.id).unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].write_count, 120);
            assert_eq!(steps[0].commit_count, 3);
            assert_eq!(steps[0].execution_context.get_u64("rows.read.count"), Some(120));
        }

        fn started_execution(store: &PostgresExecutionStore) -> JobExecution {
            let p = JobParameters::builder().add_string("correlation-id", unique("snap"), true).build();
            let instance = store.create_job_instance("rowsJob", &p).unwrap();
            let mut execution = store.create_job_execution(&instance, p).unwrap();
            execution.mark_started();
            store.update_job_execution(&execution).unwrap();
            execution
        }

        #[test]
        fn execution_reads_never_mix_two_saves() {
            let Some((_runtime, store)) = store() else {
                return;
            };
            let mut execution = started_execution(&store);
            let id = execution.id;
            let writer_store = store.clone();
            let writer = std::thread::spawn(move || {
                for n in 0..200u64 {
                    execution.exit_status.exit_description = n.to_string();
                    execution.execution_context.put("n", n);
                    writer_store.update_job_execution(&execution).unwrap();
                }
            });

            while !writer.is_finished() {
                let read = store.find_job_execution(id).unwrap().unwrap();
                let described = read.exit_status.exit_description.parse::<u64>().ok();
                assert_eq!(read.execution_context.get_u64("n"), described);
            }
            writer.join().unwrap();
        }

        #[test]
        fn conditional_update_respects_the_stored_status() {
            let Some((_runtime, store)) = store() else {
                return;
            };
            let mut execution = started_execution(&store);
            let mut stale = execution.clone();
            execution.finish(BatchStatus::Completed, batchforge_core::ExitStatus::completed());
            store.update_job_execution(&execution).unwrap();

            stale.mark_stopping();
            let running = [BatchStatus::Starting, BatchStatus::Started, BatchStatus::Stopping];
            assert!(!store.update_job_execution_if_status(&stale, &running).unwrap());
            assert_eq!(
                store.find_job_execution(execution.id).unwrap().unwrap().status,
                BatchStatus::Completed
            );
        }
    }
}
