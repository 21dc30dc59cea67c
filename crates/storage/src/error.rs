use snafu::Snafu;

/// Coarse failure taxonomy callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// The identity has no node in the remote store. Callers treat it as empty.
    NotFound,
    /// Transient transport failure, eligible for a caller-driven retry.
    Network,
    /// Malformed remote data. Retrying will not help.
    Decode,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("no remote node exists for identity '{identity}'"))]
    NotFound {
        stage: &'static str,
        identity: String,
    },
    #[snafu(display("remote store request failed on `{stage}`: {details}"))]
    Network {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("remote fetch for '{identity}' timed out after {timeout_ms}ms"))]
    FetchTimeout {
        stage: &'static str,
        identity: String,
        timeout_ms: u64,
    },
    #[snafu(display("failed to decode remote record at '{path}': {source}"))]
    Decode {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("invalid remote record at '{path}': {details}"))]
    InvalidRecord {
        stage: &'static str,
        path: String,
        details: String,
    },
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            Self::NotFound { .. } => StoreErrorKind::NotFound,
            Self::Network { .. } | Self::FetchTimeout { .. } => StoreErrorKind::Network,
            Self::Decode { .. } | Self::InvalidRecord { .. } => StoreErrorKind::Decode,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotFound { stage, .. }
            | Self::Network { stage, .. }
            | Self::FetchTimeout { stage, .. }
            | Self::Decode { stage, .. }
            | Self::InvalidRecord { stage, .. } => stage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == StoreErrorKind::Network
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
