//! Chunk transaction seam.
//!
//! Each chunk runs inside one transaction begun before the first read of the
//! chunk and committed after the writer returned. Writers that own a real
//! transactional resource can supply their own manager; the default does
//! nothing beyond bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::item::ItemError;

/// An open chunk transaction. Consumed by either outcome.
pub trait ChunkTransaction: Send {
    fn commit(self: Box<Self>) -> Result<(), ItemError>;
    fn rollback(self: Box<Self>) -> Result<(), ItemError>;
}

pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Box<dyn ChunkTransaction>, ItemError>;
}

impl<T> TransactionManager for Arc<T>
where
    T: TransactionManager + ?Sized,
{
    fn begin(&self) -> Result<Box<dyn ChunkTransaction>, ItemError> {
        (**self).begin()
    }
}

/// Transaction manager without a backing resource.
///
/// Counts outcomes so callers (and tests) can see how many chunks committed
/// or rolled back.
#[derive(Debug, Default, Clone)]
pub struct ResourcelessTransactionManager {
    stats: Arc<TransactionStats>,
}

#[derive(Debug, Default)]
struct TransactionStats {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl ResourcelessTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begun(&self) -> u64 {
        self.stats.begun.load(Ordering::Relaxed)
    }

    pub fn committed(&self) -> u64 {
        self.stats.committed.load(Ordering::Relaxed)
    }

    pub fn rolled_back(&self) -> u64 {
        self.stats.rolled_back.load(Ordering::Relaxed)
    }
}

struct ResourcelessTransaction {
    stats: Arc<TransactionStats>,
}

impl ChunkTransaction for ResourcelessTransaction {
    fn commit(self: Box<Self>) -> Result<(), ItemError> {
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), ItemError> {
        self.stats.rolled_back.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl TransactionManager for ResourcelessTransactionManager {
    fn begin(&self) -> Result<Box<dyn ChunkTransaction>, ItemError> {
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ResourcelessTransaction {
            stats: self.stats.clone(),
        }))
    }
}
