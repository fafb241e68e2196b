//! Book records: the CSV row, the stored entity and the mapping between them.

use serde::{Deserialize, Serialize};

use batchforge_infra::item::{DefaultLineMapper, DelimitedLineTokenizer, FieldSet, ItemError, ItemProcessor};

pub const FIELD_ISBN: &str = "ISBN";
pub const FIELD_TITLE: &str = "TITLE";
pub const FIELD_AUTHORS: &str = "AUTHORS";
pub const FIELD_YEAR_PUBLISHED: &str = "YEAR_PUBLISHED";

/// Longest ISBN the catalogue accepts (ISBN-13).
pub const MAX_ISBN_LEN: usize = 13;

/// A book as read from an import file or returned by the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: Option<i64>,
    pub isbn: String,
    pub title: String,
    pub authors: String,
    pub year_published: Option<i32>,
}

/// A validated book ready to be stored. `id` is assigned by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookEntity {
    pub id: Option<i64>,
    pub isbn: String,
    pub title: String,
    pub authors: String,
    pub year_published: Option<i32>,
}

impl BookEntity {
    /// Check the column constraints of the `books` table.
    pub fn validate(&self) -> Result<(), String> {
        if self.isbn.is_empty() {
            return Err("isbn is empty".to_string());
        }
        if self.isbn.chars().count() > MAX_ISBN_LEN {
            return Err(format!(
                "isbn {:?} is longer than {MAX_ISBN_LEN} characters",
                self.isbn
            ));
        }
        if self.title.is_empty() {
            return Err(format!("book {} has an empty title", self.isbn));
        }
        if self.authors.is_empty() {
            return Err(format!("book {} has no authors", self.isbn));
        }
        Ok(())
    }
}

impl From<Book> for BookEntity {
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

impl From<BookEntity> for Book {
    fn from(entity: BookEntity) -> Self {
        Self {
            id: entity.id,
            isbn: entity.isbn,
            title: entity.title,
            authors: entity.authors,
            year_published: entity.year_published,
        }
    }
}

/// Comma-delimited, `"`-quoted, exactly four columns.
pub fn book_tokenizer() -> DelimitedLineTokenizer {
    DelimitedLineTokenizer::new([FIELD_ISBN, FIELD_TITLE, FIELD_AUTHORS, FIELD_YEAR_PUBLISHED])
        .with_delimiter(b',')
        .with_quote(b'"')
        .strict(true)
}

/// Maps one CSV row to a [`Book`]. A blank year is allowed; anything else
/// in that column must be an integer.
pub fn map_field_set(fields: &FieldSet) -> Result<Book, String> {
    let year_published = match fields.read_optional_int(FIELD_YEAR_PUBLISHED)? {
        Some(year) => Some(
            i32::try_from(year).map_err(|_| format!("{FIELD_YEAR_PUBLISHED} {year} is out of range"))?,
        ),
        None => None,
    };
    Ok(Book {
        id: None,
        isbn: fields.read_trimmed(FIELD_ISBN)?.to_string(),
        title: fields.read_trimmed(FIELD_TITLE)?.to_string(),
        authors: fields.read_trimmed(FIELD_AUTHORS)?.to_string(),
        year_published,
    })
}

pub fn book_line_mapper() -> DefaultLineMapper<Book> {
    DefaultLineMapper::new(book_tokenizer(), map_field_set)
}

/// `Book → BookEntity`, rejecting rows the `books` table would refuse.
#[derive(Debug, Default, Clone, Copy)]
pub struct BookProcessor;

impl ItemProcessor<Book, BookEntity> for BookProcessor {
    fn process(&self, book: Book) -> Result<Option<BookEntity>, ItemError> {
        let entity = BookEntity::from(book);
        entity.validate().map_err(ItemError::Validation)?;
        Ok(Some(entity))
    }
}
