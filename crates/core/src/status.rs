//! Execution status and exit status.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Lifecycle status shared by job and step executions.
///
/// Declaration order is severity order: `upgrade_to` relies on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Abandoned,
    Unknown,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }

    /// STARTING, STARTED or STOPPING: an execution in this status is in flight.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Stopped
                | BatchStatus::Abandoned
        )
    }

    /// FAILED and STOPPED executions may be resumed by a new execution.
    pub fn is_restartable(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Stopped)
    }

    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, BatchStatus::Failed) || *self > BatchStatus::Failed
    }

    /// Combine two statuses, keeping the worse outcome.
    ///
    /// Anything past STARTED wins by severity; otherwise COMPLETED beats the
    /// transient starting states.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        if self > BatchStatus::Started || other > BatchStatus::Started {
            return self.max(other);
        }
        if self == BatchStatus::Completed || other == BatchStatus::Completed {
            return BatchStatus::Completed;
        }
        self.max(other)
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(BatchStatus::Completed),
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "FAILED" => Ok(BatchStatus::Failed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            "UNKNOWN" => Ok(BatchStatus::Unknown),
            other => Err(BatchError::store(format!("unknown batch status: {other}"))),
        }
    }
}

/// Exit code plus a human-readable description.
///
/// Every terminal execution carries one; failure descriptions hold the error
/// chain that ended the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: String,
    pub exit_description: String,
}

impl ExitStatus {
    pub const EXECUTING_CODE: &'static str = "EXECUTING";
    pub const COMPLETED_CODE: &'static str = "COMPLETED";
    pub const NOOP_CODE: &'static str = "NOOP";
    pub const STOPPED_CODE: &'static str = "STOPPED";
    pub const FAILED_CODE: &'static str = "FAILED";
    pub const UNKNOWN_CODE: &'static str = "UNKNOWN";

    pub fn new(exit_code: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: String::new(),
        }
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING_CODE)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED_CODE)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP_CODE)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED_CODE)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED_CODE)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN_CODE)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.exit_description = description.into();
        self
    }

    /// Append a description line, keeping whatever was recorded before.
    pub fn add_description(mut self, description: impl AsRef<str>) -> Self {
        let description = description.as_ref();
        if description.is_empty() {
            return self;
        }
        if self.exit_description.is_empty() {
            self.exit_description = description.to_string();
        } else if !self.exit_description.contains(description) {
            self.exit_description.push_str("; ");
            self.exit_description.push_str(description);
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.exit_code == Self::EXECUTING_CODE
    }

    fn severity(code: &str) -> u8 {
        match code {
            Self::EXECUTING_CODE => 1,
            Self::COMPLETED_CODE => 2,
            Self::NOOP_CODE => 3,
            Self::STOPPED_CODE => 4,
            Self::FAILED_CODE => 5,
            Self::UNKNOWN_CODE => 6,
            _ => 7,
        }
    }

    /// Combine with another exit status: the more severe code wins and both
    /// descriptions are kept.
    pub fn and(self, other: ExitStatus) -> ExitStatus {
        let (base, extra) = if Self::severity(&other.exit_code) > Self::severity(&self.exit_code) {
            (other, self)
        } else {
            (self, other)
        };
        ExitStatus::new(base.exit_code)
            .add_description(&extra.exit_description)
            .add_description(&base.exit_description)
    }

    /// Default exit status for a finished status.
    pub fn for_status(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed => Self::completed(),
            BatchStatus::Stopped | BatchStatus::Stopping => Self::stopped(),
            BatchStatus::Failed | BatchStatus::Abandoned => Self::failed(),
            BatchStatus::Starting | BatchStatus::Started => Self::executing(),
            BatchStatus::Unknown => Self::unknown(),
        }
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

impl core::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.exit_description.is_empty() {
            f.write_str(&self.exit_code)
        } else {
            write!(f, "{}: {}", self.exit_code, self.exit_description)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_running_partition_known_statuses() {
        for status in [
            BatchStatus::Completed,
            BatchStatus::Starting,
            BatchStatus::Started,
            BatchStatus::Stopping,
            BatchStatus::Stopped,
            BatchStatus::Failed,
            BatchStatus::Abandoned,
        ] {
            assert_ne!(status.is_running(), status.is_terminal(), "{status}");
        }
    }

    #[test]
    fn upgrade_keeps_worst_outcome() {
        assert_eq!(
            BatchStatus::Completed.upgrade_to(BatchStatus::Failed),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::Started.upgrade_to(BatchStatus::Completed),
            BatchStatus::Completed
        );
        assert_eq!(
            BatchStatus::Stopped.upgrade_to(BatchStatus::Failed),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::Starting.upgrade_to(BatchStatus::Started),
            BatchStatus::Started
        );
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [BatchStatus::Stopping, BatchStatus::Abandoned, BatchStatus::Completed] {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn exit_status_and_prefers_more_severe_code() {
        let combined = ExitStatus::completed()
            .with_description("step ok")
            .and(ExitStatus::failed().with_description("writer exploded"));

        assert_eq!(combined.exit_code, ExitStatus::FAILED_CODE);
        assert!(combined.exit_description.contains("writer exploded"));
        assert!(combined.exit_description.contains("step ok"));
    }

    #[test]
    fn add_description_does_not_duplicate() {
        let status = ExitStatus::failed()
            .add_description("boom")
            .add_description("boom");
        assert_eq!(status.exit_description, "boom");
    }
}
