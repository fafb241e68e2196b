//! Book import: the `importBooksJob` batch job and the book catalogue it
//! writes to.
//!
//! Reads a CSV of `ISBN,TITLE,AUTHORS,YEAR_PUBLISHED` rows, validates each
//! row and stores the books in chunks of 100.

pub mod book;
pub mod job;
pub mod repository;

pub use book::{Book, BookEntity, BookProcessor, book_line_mapper};
pub use job::{
    CORRELATION_ID_PARAMETER, FILE_PATH_PARAMETER, IMPORT_BOOKS_JOB_NAME, IMPORT_BOOKS_STEP_NAME,
    ImportBooksSettings, import_books_job, import_parameters, status_parameters,
};
pub use repository::{
    BookRepository, BookWriter, InMemoryBookRepository, PostgresBookRepository, RepositoryError,
};
