use chrono::{DateTime, Utc};
use serde::Serialize;

use batchforge_books::Book;
use batchforge_core::{BatchStatus, ExecutionSummary};

// -------------------------
// Response DTOs
// -------------------------

/// Returned by import start and by every status query.
#[derive(Debug, Serialize)]
pub struct ImportBookResponse {
    pub correlation_id: String,
    pub job_id: u64,
    pub execution_id: u64,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub exit_status: String,
}

impl ImportBookResponse {
    pub fn new(correlation_id: impl Into<String>, summary: ExecutionSummary) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            job_id: summary.instance_id.get(),
            execution_id: summary.execution_id.get(),
            create_time: summary.create_time,
            start_time: summary.start_time,
            end_time: summary.end_time,
            status: summary.status,
            exit_status: summary.exit_description,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookResponse {
    pub id: Option<i64>,
    pub isbn: String,
    pub title: String,
    pub authors: String,
    pub year_published: Option<i32>,
}

impl From<Book> for BookResponse {
    fn from(book: Book) -> Self {
        Self {
            id: book.id,
            isbn: book.isbn,
            title: book.title,
            authors: book.authors,
            year_published: book.year_published,
        }
    }
}
