//! Process-wide tracing setup shared by the batch binaries.

/// Initialize tracing for the process with the format chosen by `LOG_FORMAT`.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (filter, output format).
pub mod tracing;
