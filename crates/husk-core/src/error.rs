use thiserror::Error;

pub type HuskResult<T> = Result<T, HuskError>;

#[derive(Debug, Error)]
pub enum HuskError {
    #[error("invalid encryption policy: {0}")]
    InvalidPolicy(String),

    /// The wrapping key for this policy is not present in any reachable
    /// keyring. Callers treat this as "locked", not as a hard failure.
    #[error("wrapping key not available")]
    NoKey,

    #[error("cipher setup error: {0}")]
    CipherSetup(String),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("classified key derivation failed: {0}")]
    ClassifiedDerivation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HuskError {
    /// True when the failure means "no usable key", as opposed to a
    /// malformed policy or an environment problem.
    pub fn is_no_key(&self) -> bool {
        matches!(self, HuskError::NoKey)
    }
}
