use thiserror::Error;

/// Object-store failures, split so the client's internal retry loop knows
/// what is worth retrying.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient object-store error: {0}")]
    Transient(String),
    #[error("permanent object-store error: {0}")]
    Permanent(String),
    #[error("object-store retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Spot-market API failures. Rate limiting is its own kind because the log
/// watcher reacts to it with a dedicated backoff ladder rather than the
/// generic transient retry.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("spot-market API rate limited (429)")]
    RateLimited,
    #[error("transient spot-market error: {0}")]
    Transient(String),
    #[error("permanent spot-market error: {0}")]
    Permanent(String),
    #[error("instance {0} not found")]
    InstanceNotFound(u64),
}

/// Worker-side pipeline failures. These decide what the worker leaves
/// behind: processing failures retain the workspace and write diagnostics,
/// upload failures persist a pending-upload record for the next start.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{stage} failed: {reason}")]
    Processing { stage: &'static str, reason: String },
    #[error("final upload failed after retries: {0}")]
    Upload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_transience_is_the_retry_criterion() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(!StoreError::Permanent("denied".into()).is_transient());
        assert!(
            !StoreError::RetriesExhausted {
                attempts: 4,
                last: "timeout".into()
            }
            .is_transient()
        );
    }
}
