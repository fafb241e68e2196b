//! Item pipeline: readers, processors and writers.
//!
//! A chunk-oriented step pulls items from an [`ItemReader`] one at a time,
//! passes each through an [`ItemProcessor`] and hands the surviving outputs
//! to an [`ItemWriter`] one chunk at a time.
//!
//! Readers and writers may be stateful ([`ItemStream`]): they are opened with
//! the step's execution context, asked to `update` it at every chunk commit
//! and closed at the end of the step. That is what makes restart possible.

pub mod file;
pub mod processors;
pub mod readers;
pub mod writers;

use thiserror::Error;

use batchforge_core::ExecutionContext;

pub use file::{DefaultLineMapper, DelimitedLineTokenizer, FieldSet, FlatFileItemReader, LineMapper};
pub use processors::{FnItemProcessor, PassThroughItemProcessor};
pub use readers::ListItemReader;
pub use writers::{FnItemWriter, VecItemWriter};

/// Failure raised by a reader, processor, writer or the chunk transaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    /// The input could not be read (I/O, corrupt source).
    #[error("read failed: {0}")]
    Read(String),

    /// A record could not be parsed into an item.
    #[error("parse failed at line {line}: {message}")]
    Parse { line: u64, message: String },

    /// An item was read but rejected by validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The processor failed for a reason other than validation.
    #[error("process failed: {0}")]
    Process(String),

    /// The writer failed; the whole chunk is rolled back.
    #[error("write failed: {0}")]
    Write(String),

    /// Opening, updating or closing a stream failed.
    #[error("stream failed: {0}")]
    Stream(String),

    /// Begin/commit/rollback of the chunk transaction failed.
    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl ItemError {
    pub fn read(msg: impl Into<String>) -> Self {
        Self::Read(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }
}

/// Stateful lifecycle shared by readers and writers.
pub trait ItemStream {
    /// Prepare for reading/writing, restoring any saved position from `ctx`.
    fn open(&mut self, _ctx: &ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    /// Save the current position into `ctx`. Called once per committed chunk.
    fn update(&mut self, _ctx: &mut ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), ItemError> {
        Ok(())
    }
}

/// Produces a finite sequence of items.
///
/// `Ok(None)` marks the end of input; it is not an error.
pub trait ItemReader<T>: ItemStream + Send {
    fn read(&mut self) -> Result<Option<T>, ItemError>;
}

/// Pure transformation from an input item to an output item.
///
/// `Ok(None)` filters the item out of the chunk. Processors must not have
/// externally visible side effects: a rolled back chunk is processed again
/// on restart.
pub trait ItemProcessor<I, O>: Send + Sync {
    fn process(&self, item: I) -> Result<Option<O>, ItemError>;
}

/// Consumes one chunk of items at a time.
///
/// `write` is called once per chunk, never with an empty chunk. The step
/// saves its progress next and only then calls `commit`; if anything fails
/// in between it calls `rollback` instead. Writers that stage their output
/// until `commit` never publish a chunk whose progress was not recorded.
/// Writers that publish in `write` keep the default no-op hooks and get
/// at-least-once delivery.
pub trait ItemWriter<O>: ItemStream + Send {
    fn write(&mut self, chunk: &Chunk<O>) -> Result<(), ItemError>;

    fn commit(&mut self) -> Result<(), ItemError> {
        Ok(())
    }

    fn rollback(&mut self) {}
}

/// An ordered batch of processed items, committed atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<O> {
    items: Vec<O>,
}

impl<O> Chunk<O> {
    pub fn new(items: Vec<O>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[O] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, O> {
        self.items.iter()
    }

    pub fn into_items(self) -> Vec<O> {
        self.items
    }
}

impl<'a, O> IntoIterator for &'a Chunk<O> {
    type Item = &'a O;
    type IntoIter = std::slice::Iter<'a, O>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<I, O, T> ItemProcessor<I, O> for std::sync::Arc<T>
where
    T: ItemProcessor<I, O> + ?Sized,
{
    fn process(&self, item: I) -> Result<Option<O>, ItemError> {
        (**self).process(item)
    }
}
