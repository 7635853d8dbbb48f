use thiserror::Error;

/// Configuration errors raised synchronously while building profiles, monitors,
/// clusters and tests. They are fatal to the construction call that raised them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("No collector for statistic: {0}")]
    UnknownStatistic(String),

    #[error("Invalid parameters for {name}: {reason}")]
    InvalidCollector { name: String, reason: String },

    #[error("Incompatible histograms: {ours} buckets vs {theirs} buckets")]
    IncompatibleHistograms { ours: usize, theirs: usize },

    #[error("Cannot merge a {theirs} into a {ours}")]
    IncompatibleStats {
        ours: &'static str,
        theirs: &'static str,
    },

    #[error("No step registered under the name: {0}")]
    UnknownStep(String),

    #[error("No operation registered under the name: {0}")]
    UnknownOperation(String),

    #[error("A cluster can only be started once its transport is running")]
    TransportNotRunning,

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Already started")]
    AlreadyStarted,

    #[error("No tests")]
    NoTests,

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
