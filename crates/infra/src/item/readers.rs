//! In-memory readers.

use std::collections::VecDeque;

use batchforge_core::ExecutionContext;

use super::{ItemError, ItemReader, ItemStream};

/// Reads items from an owned list.
///
/// Saves `"{name}.read.count"` at every commit; when reopened with that key
/// present it drops the already consumed prefix, so a restarted step picks up
/// right after the last committed chunk.
#[derive(Debug)]
pub struct ListItemReader<T> {
    name: String,
    items: VecDeque<T>,
    read_count: u64,
}

impl<T> ListItemReader<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items: items.into(),
            read_count: 0,
        }
    }

    fn count_key(&self) -> String {
        format!("{}.read.count", self.name)
    }
}

impl<T> ItemStream for ListItemReader<T> {
    fn open(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        let Some(already_read) = ctx.get_u64(&self.count_key()) else {
            return Ok(());
        };
        while self.read_count < already_read {
            if self.items.pop_front().is_none() {
                return Err(ItemError::stream(format!(
                    "{}: cannot restore position {already_read}, only {} items available",
                    self.name, self.read_count
                )));
            }
            self.read_count += 1;
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut ExecutionContext) -> Result<(), ItemError> {
        ctx.put(self.count_key(), self.read_count);
        Ok(())
    }
}

impl<T: Send> ItemReader<T> for ListItemReader<T> {
    fn read(&mut self) -> Result<Option<T>, ItemError> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.read_count += 1;
        }
        Ok(item)
    }
}
