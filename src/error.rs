//! Error types for the e2e harness

use std::time::Duration;

use thiserror::Error;

use crate::client::{ClientError, ResourceRef};

/// Main error type for harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The cluster rejected a create call; fatal to the scenario
    #[error("failed to create {resource}: {source}")]
    ResourceCreation {
        resource: String,
        #[source]
        source: ClientError,
    },

    /// A stage predicate never held before its deadline
    #[error("{0}")]
    StageTimeout(Box<StageFailure>),

    /// A stage observed a terminal failure condition before its deadline
    #[error("{0}")]
    StageFailed(Box<StageFailure>),

    /// A fetch failed mid-poll; retried until the stage deadline
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    /// Teardown could not remove resources the scenario created
    #[error("teardown incomplete, {} resource(s) may remain: {}", .0.len(), format_refs(.0))]
    TeardownIncomplete(Vec<ResourceRef>),

    /// The scenario was interrupted before it finished
    #[error("interrupted")]
    Interrupted,

    /// Cluster client error outside of resource creation
    #[error("cluster error: {0}")]
    Client(#[from] ClientError),

    /// Workload request violates its construction contract
    #[error("invalid workload request: {0}")]
    InvalidRequest(String),

    /// Static content could not be read or prepared
    #[error("content error: {0}")]
    Content(String),

    /// Harness configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create an invalid request error with the given message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a content error with the given message
    pub fn content(msg: impl Into<String>) -> Self {
        Self::Content(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Returns true for the errors that abort a scenario
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TransientFetch(_))
    }

    /// The stage that failed, if this error came out of a polling stage
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            Self::StageTimeout(f) | Self::StageFailed(f) => Some(&f.stage),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

fn format_refs(refs: &[ResourceRef]) -> String {
    refs.iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Diagnostic payload for a stage that did not pass
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub stage: String,
    pub expectation: String,
    pub elapsed: Duration,
    pub deadline: Duration,
    pub polls: u32,
    /// why the last successful observation did not match
    pub mismatch: Option<String>,
    /// terminal condition reported by the predicate
    pub terminal_reason: Option<String>,
    /// most recent fetch error, if any poll failed
    pub last_fetch_error: Option<String>,
    /// true when no poll ever produced an observation
    pub never_observed: bool,
    /// last observed remote state rendered as YAML
    pub snapshot: Option<String>,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.terminal_reason {
            Some(reason) => write!(
                f,
                "stage '{}' failed after {}s: expected {}, observed terminal condition: {}",
                self.stage,
                self.elapsed.as_secs(),
                self.expectation,
                reason
            )?,
            None => write!(
                f,
                "stage '{}' timed out after {}s (deadline {}s, {} polls): expected {}",
                self.stage,
                self.elapsed.as_secs(),
                self.deadline.as_secs(),
                self.polls,
                self.expectation
            )?,
        }

        if let Some(mismatch) = &self.mismatch {
            write!(f, "; last mismatch: {}", mismatch)?;
        }

        if let Some(fetch_error) = &self.last_fetch_error {
            if self.never_observed {
                write!(
                    f,
                    "; remote state was never observed, every fetch failed (last error: {})",
                    fetch_error
                )?;
            } else {
                write!(f, "; last fetch error: {}", fetch_error)?;
            }
        }

        match &self.snapshot {
            Some(snapshot) => write!(f, "\nlast observed state:\n{}", snapshot.trim_end()),
            None => Ok(()),
        }
    }
}

/// Convenience type alias for harness results
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> StageFailure {
        StageFailure {
            stage: "Running".to_string(),
            expectation: "PyTorchJob condition Running=True".to_string(),
            elapsed: Duration::from_secs(600),
            deadline: Duration::from_secs(600),
            polls: 121,
            mismatch: Some("Running=Unknown".to_string()),
            terminal_reason: None,
            last_fetch_error: None,
            never_observed: false,
            snapshot: Some("status: {}\n".to_string()),
        }
    }

    #[test]
    fn test_timeout_message_names_stage_and_snapshot() {
        let err = Error::StageTimeout(Box::new(failure()));
        let msg = err.to_string();
        assert!(msg.starts_with("stage 'Running' timed out after 600s"));
        assert!(msg.contains("expected PyTorchJob condition Running=True"));
        assert!(msg.contains("last mismatch: Running=Unknown"));
        assert!(msg.ends_with("last observed state:\nstatus: {}"));
        assert_eq!(err.failed_stage(), Some("Running"));
    }

    #[test]
    fn test_persistent_fetch_errors_reported_distinctly() {
        let mut f = failure();
        f.mismatch = None;
        f.snapshot = None;
        f.never_observed = true;
        f.last_fetch_error = Some("connection refused".to_string());

        let msg = Error::StageTimeout(Box::new(f)).to_string();
        assert!(msg.contains("never observed"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_terminal_failure_message() {
        let mut f = failure();
        f.terminal_reason = Some("Failed=True (BackoffLimitExceeded)".to_string());
        let msg = Error::StageFailed(Box::new(f)).to_string();
        assert!(msg.contains("failed after 600s"));
        assert!(msg.contains("BackoffLimitExceeded"));
    }

    #[test]
    fn test_transient_errors_are_not_fatal() {
        assert!(!Error::TransientFetch("timeout".to_string()).is_fatal());
        assert!(Error::Interrupted.is_fatal());
        assert!(Error::config("bad").is_fatal());
    }
}
