//! Error types for shaping and telemetry processing.
//!
//! All errors implement `std::error::Error` and carry enough context to decide
//! how far they propagate. The session supervisor uses [`Error::is_fatal`] to
//! decide between logging, marking the session degraded, or tearing it down.
//!
//! ## Error Categories
//!
//! - **Config Errors**: Invalid user input, detected before a session starts
//! - **Pattern Exhaustion**: A non-looping pattern has been played to the end
//! - **Decode Errors**: Unrecognized frame types from the telemetry device
//! - **Device / Control File Errors**: I/O on the kernel debug interface
//! - **Persistence Errors**: Storage collaborator or CSV failures
//! - **Command Errors**: `tc` / `nft` invocations that returned non-zero
//!
//! ## Recovery
//!
//! ```rust
//! use ratecast::Error;
//!
//! let error = Error::unknown_record_type(42);
//! assert!(error.is_recoverable());
//! assert!(!error.is_fatal());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for ratecast operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Data rate pattern exhausted")]
    PatternExhausted,

    #[error("Unknown record type {tag}")]
    UnknownRecordType { tag: u8 },

    #[error("Telemetry device error: {path}")]
    Device {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Control file error: {path}")]
    ControlFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Persistence error in {context}")]
    Persistence {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Command '{command}' failed with {status} [stdout: '{stdout}', stderr: '{stderr}']")]
    Command { command: String, status: String, stdout: String, stderr: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Session channel closed: {channel}")]
    ChannelClosed { channel: &'static str },

    #[error("Session cancelled before playback started")]
    Cancelled,
}

impl Error {
    /// Returns whether this error must tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config { .. } => true,
            Error::PatternExhausted => false,
            Error::UnknownRecordType { .. } => false,
            Error::Device { .. } => true,
            Error::ControlFile { .. } => true,
            Error::Persistence { .. } => false,
            Error::Command { .. } => true,
            Error::Timeout { .. } => true,
            Error::ChannelClosed { .. } => true,
            Error::Cancelled => false,
        }
    }

    /// Returns whether the operation that produced this error can simply continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::UnknownRecordType { .. } | Error::Persistence { .. } | Error::PatternExhausted
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Error::Config { .. } => vec![
                "Check the play configuration values",
                "Verify the pattern file path and format",
            ],
            Error::PatternExhausted => vec!["Enable looping to replay the pattern indefinitely"],
            Error::UnknownRecordType { .. } => vec![
                "Check that the loaded qdisc module matches the expected record layout",
                "Frames of unknown type are skipped",
            ],
            Error::Device { .. } => vec![
                "Ensure debugfs is mounted at /sys/kernel/debug",
                "Verify the janz qdisc is installed on the device",
                "Run with sufficient privileges to read debugfs",
            ],
            Error::ControlFile { .. } => vec![
                "Verify the qdisc was created successfully",
                "Run with sufficient privileges to write debugfs",
            ],
            Error::Persistence { .. } => vec![
                "Check the storage backend connection",
                "Check free disk space for CSV export",
            ],
            Error::Command { .. } => vec![
                "Verify tc and nft are installed",
                "Check that the network device exists",
                "Run with CAP_NET_ADMIN",
            ],
            Error::Timeout { .. } => vec!["Increase the shutdown grace period"],
            Error::ChannelClosed { .. } => vec!["Restart the session"],
            Error::Cancelled => vec![],
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config { reason: reason.into() }
    }

    /// Helper constructor for unknown record type errors.
    pub fn unknown_record_type(tag: u8) -> Self {
        Error::UnknownRecordType { tag }
    }

    /// Helper constructor for telemetry device errors.
    pub fn device(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Device { path: path.into(), source }
    }

    /// Helper constructor for control file errors.
    pub fn control_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::ControlFile { path: path.into(), source }
    }

    /// Helper constructor for persistence errors without an underlying cause.
    pub fn persistence(context: impl Into<String>) -> Self {
        Error::Persistence { context: context.into(), source: None }
    }

    /// Helper constructor for persistence errors with an underlying cause.
    pub fn persistence_with_source(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Persistence { context: context.into(), source: Some(source.into()) }
    }
}

/// Severity attached to a report sent to the session supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Fatal,
}

impl Severity {
    /// Default severity for an error that reached the report path.
    pub fn of(error: &Error) -> Self {
        if error.is_fatal() { Severity::Fatal } else { Severity::Warn }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn messages_contain_their_context(
                reason in ".*",
                tag in any::<u8>(),
                stderr in "[a-z ]*",
            ) {
                let config = Error::config(reason.clone());
                prop_assert!(config.to_string().contains(&reason));

                let decode = Error::unknown_record_type(tag);
                prop_assert!(decode.to_string().contains(&tag.to_string()));

                let command = Error::Command {
                    command: "tc qdisc add".to_string(),
                    status: "exit status: 2".to_string(),
                    stdout: String::new(),
                    stderr: stderr.clone(),
                };
                prop_assert!(command.to_string().contains(&stderr));
            }

            #[test]
            fn decode_errors_never_escalate(tag in any::<u8>()) {
                let error = Error::unknown_record_type(tag);
                prop_assert!(!error.is_fatal());
                prop_assert_eq!(Severity::of(&error), Severity::Warn);
            }
        }
    }

    #[test]
    fn classification_matches_taxonomy() {
        let io = || std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");

        assert!(Error::config("freq").is_fatal());
        assert!(!Error::PatternExhausted.is_fatal());
        assert!(Error::PatternExhausted.is_recoverable());
        assert!(Error::device("/sys/kernel/debug/x", io()).is_fatal());
        assert!(Error::control_file("/sys/kernel/debug/y", io()).is_fatal());
        assert!(!Error::persistence("commit").is_fatal());
        assert!(Error::persistence("commit").is_recoverable());
    }

    #[test]
    fn source_chain_is_preserved() {
        let inner = std::io::Error::other("disk full");
        let error = Error::persistence_with_source("csv flush", inner);

        let source = std::error::Error::source(&error).expect("source should be kept");
        assert_eq!(source.to_string(), "disk full");
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<Error>();
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = [
            Error::config("x"),
            Error::PatternExhausted,
            Error::unknown_record_type(1),
            Error::persistence("x"),
            Error::Timeout { duration: Duration::from_secs(5) },
            Error::ChannelClosed { channel: "summaries" },
        ];
        for error in &errors {
            assert!(!error.recovery_suggestions().is_empty(), "{error} has no suggestions");
        }
    }
}
