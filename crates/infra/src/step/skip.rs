//! Skip classification for item failures.
//!
//! Only read and process failures are ever offered to a policy; a write
//! failure always fails the chunk. There is no retry classification.

use crate::item::ItemError;

/// Where in the pipeline an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    Read,
    Process,
}

impl core::fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ItemPhase::Read => f.write_str("read"),
            ItemPhase::Process => f.write_str("process"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    /// Drop the item and keep going.
    Skip,
    /// Fail the chunk with this error.
    Fail,
    /// The error is skippable but the step has used up its skips.
    LimitExceeded { limit: u64 },
}

/// Decides whether a failed item may be skipped.
///
/// `skips_so_far` counts every skip of the current step execution, including
/// the uncommitted ones of the chunk in progress.
pub trait SkipPolicy: Send + Sync {
    fn classify(&self, error: &ItemError, phase: ItemPhase, skips_so_far: u64) -> SkipDecision;
}

/// Every failure is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverSkip;

impl SkipPolicy for NeverSkip {
    fn classify(&self, _error: &ItemError, _phase: ItemPhase, _skips_so_far: u64) -> SkipDecision {
        SkipDecision::Fail
    }
}

/// Skips errors accepted by `skippable` until `limit` skips have happened.
#[derive(Debug, Clone, Copy)]
pub struct LimitedSkip {
    limit: u64,
    skippable: fn(&ItemError) -> bool,
}

impl LimitedSkip {
    pub fn new(limit: u64, skippable: fn(&ItemError) -> bool) -> Self {
        Self { limit, skippable }
    }

    /// Skip unparsable and invalid records, nothing else.
    pub fn bad_records(limit: u64) -> Self {
        Self::new(limit, |e| {
            matches!(e, ItemError::Parse { .. } | ItemError::Validation(_))
        })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl SkipPolicy for LimitedSkip {
    fn classify(&self, error: &ItemError, _phase: ItemPhase, skips_so_far: u64) -> SkipDecision {
        if !(self.skippable)(error) {
            return SkipDecision::Fail;
        }
        if skips_so_far >= self.limit {
            return SkipDecision::LimitExceeded { limit: self.limit };
        }
        SkipDecision::Skip
    }
}
