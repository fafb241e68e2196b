//! Stock writers.

use std::sync::{Arc, Mutex};

use super::{Chunk, ItemError, ItemStream, ItemWriter};

/// Collects committed chunks into shared memory. Mostly useful in tests and
/// demos.
///
/// A written chunk is held back until the step commits it and dropped if
/// the step rolls back.
#[derive(Debug)]
pub struct VecItemWriter<O> {
    chunks: Arc<Mutex<Vec<Vec<O>>>>,
    pending: Option<Vec<O>>,
}

impl<O> Clone for VecItemWriter<O> {
    fn clone(&self) -> Self {
        Self {
            chunks: self.chunks.clone(),
            pending: None,
        }
    }
}

impl<O> Default for VecItemWriter<O> {
    fn default() -> Self {
        Self {
            chunks: Arc::new(Mutex::new(Vec::new())),
            pending: None,
        }
    }
}

impl<O: Clone> VecItemWriter<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every chunk committed so far, in commit order.
    pub fn chunks(&self) -> Vec<Vec<O>> {
        self.chunks.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn items(&self) -> Vec<O> {
        self.chunks().into_iter().flatten().collect()
    }
}

impl<O> ItemStream for VecItemWriter<O> {}

impl<O: Clone + Send> ItemWriter<O> for VecItemWriter<O> {
    fn write(&mut self, chunk: &Chunk<O>) -> Result<(), ItemError> {
        self.pending
            .get_or_insert_with(Vec::new)
            .extend(chunk.items().iter().cloned());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ItemError> {
        let Some(items) = self.pending.take() else {
            return Ok(());
        };
        let mut chunks = self
            .chunks
            .lock()
            .map_err(|_| ItemError::write("lock poisoned"))?;
        chunks.push(items);
        Ok(())
    }

    fn rollback(&mut self) {
        self.pending = None;
    }
}

/// Writer backed by a closure.
pub struct FnItemWriter<F> {
    f: F,
}

impl<F> FnItemWriter<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ItemStream for FnItemWriter<F> {}

impl<O, F> ItemWriter<O> for FnItemWriter<F>
where
    F: FnMut(&Chunk<O>) -> Result<(), ItemError> + Send,
{
    fn write(&mut self, chunk: &Chunk<O>) -> Result<(), ItemError> {
        (self.f)(chunk)
    }
}
