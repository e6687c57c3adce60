// ABOUTME: Error taxonomy for watermark sync - configuration, resolver, source and sink failures
// ABOUTME: Only ConfigError is fatal; everything else is contained within a single cycle

use std::path::PathBuf;

use thiserror::Error;

/// Fatal, startup-time configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("exactly one of `source.statement` or `source.statement_filepath` must be set")]
    StatementSource,

    #[error("failed to read statement file {path:?}: {source}")]
    StatementFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("statement is empty")]
    EmptyStatement,

    #[error("parameter `{0}` is reserved for the watermark and cannot be configured")]
    ReservedParameter(String),

    #[error("placeholder `:{0}` appears inside a quoted string literal and would never be bound")]
    QuotedReservedPlaceholder(String),

    #[error("statement mixes native positional placeholders (`${0}`) with named placeholders")]
    PositionalPlaceholder(String),

    #[error("statement references `:{0}` but no such parameter is configured")]
    UnknownParameter(String),

    #[error("unterminated {0} in statement")]
    Unterminated(&'static str),

    #[error("invalid {kind} `{value}`: {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("invalid source url `{0}`: {1}")]
    InvalidSourceUrl(String, String),

    #[error("invalid destination endpoint `{0}`: {1}")]
    InvalidEndpoint(String, String),

    #[error("invalid schedule `{0}`: {1}")]
    InvalidSchedule(String, String),

    #[error("`{0}` must be greater than zero")]
    NotPositive(&'static str),
}

/// Why the resolver refused to produce a watermark this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    #[error("destination degraded: {0}")]
    DestinationDegraded(String),

    #[error("destination refresh failed: {0}")]
    DestinationRefreshFailed(String),

    #[error("unexpected resolver error: {0}")]
    Unexpected(String),
}

impl AbortReason {
    /// Short name of the resolver phase that failed, for log lines.
    pub fn phase(&self) -> &'static str {
        match self {
            AbortReason::DestinationDegraded(_) => "health",
            AbortReason::DestinationRefreshFailed(_) => "refresh",
            AbortReason::Unexpected(_) => "query",
        }
    }
}

/// Failure while binding a watermark into the statement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("cannot bind an aborted watermark")]
    Aborted,
}

/// Failure while executing the statement or fetching rows.
#[derive(Debug, Error)]
#[error("source query failed: {message}")]
pub struct SourceError {
    pub message: String,
    #[source]
    pub source: Option<tokio_postgres::Error>,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn postgres(message: impl Into<String>, source: tokio_postgres::Error) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// The downstream sink refused an event.
#[derive(Debug, Error)]
#[error("sink rejected event: {0}")]
pub struct SinkError(pub String);

/// Per-cycle failure recorded in a `CycleOutcome`.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("cycle aborted during {phase}: {0}", phase = .0.phase())]
    Aborted(AbortReason),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    SourceQuery(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Reasons the scheduler itself stops with an error.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0} consecutive cycles aborted during watermark resolution (last: {1})")]
    TooManyAborts(u32, AbortReason),

    #[error("scheduler task panicked: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_reason_phase() {
        assert_eq!(
            AbortReason::DestinationDegraded("red".to_string()).phase(),
            "health"
        );
        assert_eq!(
            AbortReason::DestinationRefreshFailed("boom".to_string()).phase(),
            "refresh"
        );
        assert_eq!(AbortReason::Unexpected("bad".to_string()).phase(), "query");
    }

    #[test]
    fn test_cycle_error_mentions_phase() {
        let err = CycleError::Aborted(AbortReason::DestinationRefreshFailed(
            "timeout".to_string(),
        ));
        let msg = err.to_string();
        assert!(msg.contains("refresh"));
        assert!(msg.contains("timeout"));
    }
}
