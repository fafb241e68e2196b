//! Book storage and the chunk writer that feeds it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, instrument};

use batchforge_infra::item::{Chunk, ItemError, ItemStream, ItemWriter};

use crate::book::BookEntity;

const SCHEMA: &str = include_str!("../migrations/0001_books.sql");

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("a book with isbn {0} already exists")]
    DuplicateIsbn(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// The book catalogue.
pub trait BookRepository: Send + Sync {
    /// Store every book or none of them. Returns the books with ids assigned.
    fn save_all(&self, books: &[BookEntity]) -> Result<Vec<BookEntity>, RepositoryError>;

    /// All books ordered by id.
    fn find_all(&self) -> Result<Vec<BookEntity>, RepositoryError>;

    fn find_by_isbn(&self, isbn: &str) -> Result<Option<BookEntity>, RepositoryError>;

    fn count(&self) -> Result<u64, RepositoryError>;
}

impl<R> BookRepository for Arc<R>
where
    R: BookRepository + ?Sized,
{
    fn save_all(&self, books: &[BookEntity]) -> Result<Vec<BookEntity>, RepositoryError> {
        (**self).save_all(books)
    }

    fn find_all(&self) -> Result<Vec<BookEntity>, RepositoryError> {
        (**self).find_all()
    }

    fn find_by_isbn(&self, isbn: &str) -> Result<Option<BookEntity>, RepositoryError> {
        (**self).find_by_isbn(isbn)
    }

    fn count(&self) -> Result<u64, RepositoryError> {
        (**self).count()
    }
}

#[derive(Debug, Default)]
struct Catalogue {
    next_id: i64,
    by_id: BTreeMap<i64, BookEntity>,
    ids_by_isbn: BTreeMap<String, i64>,
}

/// In-memory catalogue.
#[derive(Debug, Default)]
pub struct InMemoryBookRepository {
    inner: RwLock<Catalogue>,
}

impl InMemoryBookRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BookRepository for InMemoryBookRepository {
    fn save_all(&self, books: &[BookEntity]) -> Result<Vec<BookEntity>, RepositoryError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| RepositoryError::Storage("book catalogue lock poisoned".to_string()))?;

        let mut batch = std::collections::BTreeSet::new();
        for book in books {
            if inner.ids_by_isbn.contains_key(&book.isbn) || !batch.insert(book.isbn.as_str()) {
                return Err(RepositoryError::DuplicateIsbn(book.isbn.clone()));
            }
        }

        let mut saved = Vec::with_capacity(books.len());
        for book in books {
            inner.next_id += 1;
            let id = inner.next_id;
            let stored = BookEntity {
                id: Some(id),
                ..book.clone()
            };
            inner.ids_by_isbn.insert(stored.isbn.clone(), id);
            inner.by_id.insert(id, stored.clone());
            saved.push(stored);
        }
        Ok(saved)
    }

    fn find_all(&self) -> Result<Vec<BookEntity>, RepositoryError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| RepositoryError::Storage("book catalogue lock poisoned".to_string()))?;
        Ok(inner.by_id.values().cloned().collect())
    }

    fn find_by_isbn(&self, isbn: &str) -> Result<Option<BookEntity>, RepositoryError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| RepositoryError::Storage("book catalogue lock poisoned".to_string()))?;
        Ok(inner
            .ids_by_isbn
            .get(isbn)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    fn count(&self) -> Result<u64, RepositoryError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| RepositoryError::Storage("book catalogue lock poisoned".to_string()))?;
        Ok(inner.by_id.len() as u64)
    }
}

/// Postgres catalogue over the `books` table.
#[derive(Debug, Clone)]
pub struct PostgresBookRepository {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresBookRepository {
    /// Must be called from inside a tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, RepositoryError> {
        let runtime = Handle::try_current().map_err(|_| {
            RepositoryError::Storage("PostgresBookRepository requires a tokio runtime".to_string())
        })?;
        Ok(Self { pool, runtime })
    }

    pub fn with_handle(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// A current-thread runtime cannot be blocked from one of its own
    /// threads, so calls made there fail instead of panicking.
    fn block_on<T, F>(&self, fut: F) -> Result<T, RepositoryError>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.runtime.block_on(fut))
            }
            Ok(_) => Err(RepositoryError::Storage(
                "PostgresBookRepository called from a current-thread runtime; use a multi-threaded runtime or spawn_blocking".to_string(),
            )),
            Err(_) => self.runtime.block_on(fut),
        }
    }

    #[instrument(skip(self, books), fields(count = books.len()), err)]
    pub async fn insert_all(&self, books: &[BookEntity]) -> Result<Vec<BookEntity>, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut saved = Vec::with_capacity(books.len());
        for book in books {
            let row = sqlx::query(
                r#"
                INSERT INTO books (isbn, title, authors, year_published)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(&book.isbn)
            .bind(&book.title)
            .bind(&book.authors)
            .bind(book.year_published)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if unique_violation(&e) {
                    RepositoryError::DuplicateIsbn(book.isbn.clone())
                } else {
                    map_sqlx_error("insert_book", e)
                }
            })?;
            let id: i64 = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("insert_book", e))?;
            saved.push(BookEntity {
                id: Some(id),
                ..book.clone()
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(saved)
    }

    pub async fn select_all(&self) -> Result<Vec<BookEntity>, RepositoryError> {
        let rows = sqlx::query("SELECT id, isbn, title, authors, year_published FROM books ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_books", e))?;
        rows.iter().map(book_from_row).collect()
    }

    pub async fn select_by_isbn(&self, isbn: &str) -> Result<Option<BookEntity>, RepositoryError> {
        let row = sqlx::query("SELECT id, isbn, title, authors, year_published FROM books WHERE isbn = $1")
            .bind(isbn)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_book_by_isbn", e))?;
        row.as_ref().map(book_from_row).transpose()
    }

    pub async fn count_books(&self) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_books", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl BookRepository for PostgresBookRepository {
    fn save_all(&self, books: &[BookEntity]) -> Result<Vec<BookEntity>, RepositoryError> {
        self.block_on(self.insert_all(books))
    }

    fn find_all(&self) -> Result<Vec<BookEntity>, RepositoryError> {
        self.block_on(self.select_all())
    }

    fn find_by_isbn(&self, isbn: &str) -> Result<Option<BookEntity>, RepositoryError> {
        self.block_on(self.select_by_isbn(isbn))
    }

    fn count(&self) -> Result<u64, RepositoryError> {
        self.block_on(self.count_books())
    }
}

fn book_from_row(row: &PgRow) -> Result<BookEntity, RepositoryError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_book", e);
    Ok(BookEntity {
        id: Some(row.try_get("id").map_err(decode)?),
        isbn: row.try_get("isbn").map_err(decode)?,
        title: row.try_get("title").map_err(decode)?,
        authors: row.try_get("authors").map_err(decode)?,
        year_published: row.try_get("year_published").map_err(decode)?,
    })
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(format!("{operation}: {err}"))
}

/// Saves each chunk with one [`BookRepository::save_all`] call once the
/// step commits it. A rolled back chunk never reaches the repository.
pub struct BookWriter {
    repository: Arc<dyn BookRepository>,
    pending: Vec<BookEntity>,
}

impl BookWriter {
    pub fn new(repository: Arc<dyn BookRepository>) -> Self {
        Self {
            repository,
            pending: Vec::new(),
        }
    }
}

impl ItemStream for BookWriter {}

impl ItemWriter<BookEntity> for BookWriter {
    fn write(&mut self, chunk: &Chunk<BookEntity>) -> Result<(), ItemError> {
        debug!(count = chunk.len(), "staging chunk of books");
        self.pending.extend(chunk.iter().cloned());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ItemError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let books = std::mem::take(&mut self.pending);
        let saved = self
            .repository
            .save_all(&books)
            .map_err(|e| ItemError::write(e.to_string()))?;
        info!(count = saved.len(), "books saved");
        Ok(())
    }

    fn rollback(&mut self) {
        self.pending.clear();
    }
}
