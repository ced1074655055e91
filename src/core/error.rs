use std::fmt;

/// Everything that can stop a bootstrap attempt.
///
/// Fetch-level failures (`Network`, `Transport`) make the orchestrator move
/// on to the next candidate URL; every other variant ends the attempt.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("request to {url} could not complete: {reason}")]
    Network { url: String, reason: String },

    #[error("{url} answered {status} {reason}")]
    Transport {
        url: String,
        status: u16,
        reason: String,
    },

    #[error("{url} did not deliver a binary module ({len} bytes, header {header})")]
    Format {
        url: String,
        len: usize,
        header: String,
    },

    #[error("module imports {namespace}.{name}, which this host does not provide")]
    ImportResolution { namespace: String, name: String },

    #[error("module instantiation failed: {source}")]
    Instantiation {
        #[source]
        source: wasmtime::Error,
    },

    #[error("module raised an error in `{export}`: {message}")]
    ModuleCall { export: String, message: String },

    #[error("companion script {url} did not publish a module after {attempts} checks {interval_ms}ms apart")]
    RecoveryTimeout {
        url: String,
        attempts: u32,
        interval_ms: u64,
    },

    #[error("script {url} rejected: {reason}")]
    Script { url: String, reason: String },

    #[error("a module instance is already published")]
    AlreadyInitialized,

    #[error("another bootstrap attempt is still initializing the module")]
    InitializationInProgress,

    #[error("native bridge script could not be loaded: {}", join_failures(.failures))]
    BridgeUnavailable { failures: Vec<UrlFailure> },

    #[error("native bridge not ready after {attempts} checks {interval_ms}ms apart")]
    BridgeTimeout { attempts: u32, interval_ms: u64 },

    #[error("every candidate URL failed: {}", join_failures(.failures))]
    FallbacksExhausted { failures: Vec<UrlFailure> },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BootError {
    /// True for failures that say nothing about the payload itself, so the
    /// next candidate URL is worth a try.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, BootError::Network { .. } | BootError::Transport { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BootError::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One failed attempt in a fallback chain.
#[derive(Debug)]
pub struct UrlFailure {
    pub url: String,
    pub error: BootError,
}

impl fmt::Display for UrlFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.url, self.error)
    }
}

fn join_failures(failures: &[UrlFailure]) -> String {
    if failures.is_empty() {
        return "no URLs configured".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type BootResult<T> = Result<T, BootError>;
