//! Error types for code issuance and verification

/// The closed set of outcomes a caller can be refused with.
///
/// Also stored as the failure reason on audit entries, hence the CBOR derive.
#[derive(
    thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode,
)]
pub enum CodeError {
    #[n(0)]
    #[error("caller lacks the capability for this operation")]
    PermissionDenied,
    #[n(1)]
    #[error("package or shipment not found")]
    NotFound,
    #[n(2)]
    #[error("package is locked after repeated failed attempts")]
    Locked,
    #[n(3)]
    #[error("claimed recipient does not own this package")]
    IdentityMismatch,
    #[n(4)]
    #[error("no code has been issued for this package")]
    NoCodeIssued,
    #[n(5)]
    #[error("pickup code has expired")]
    Expired,
    #[n(6)]
    #[error("pickup code has already been used")]
    AlreadyUsed,
    #[n(7)]
    #[error("pickup code does not match")]
    InvalidCode,
    #[n(8)]
    #[error("could not draw an unused code within the attempt budget")]
    GenerationExhausted,
    #[n(9)]
    #[error("internal storage failure")]
    SystemError,
}

impl CodeError {
    /// Stable snake_case label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeError::PermissionDenied => "permission_denied",
            CodeError::NotFound => "not_found",
            CodeError::Locked => "locked",
            CodeError::IdentityMismatch => "identity_mismatch",
            CodeError::NoCodeIssued => "no_code_issued",
            CodeError::Expired => "expired",
            CodeError::AlreadyUsed => "already_used",
            CodeError::InvalidCode => "invalid_code",
            CodeError::GenerationExhausted => "generation_exhausted",
            CodeError::SystemError => "system_error",
        }
    }
}

/// Infrastructure failures below the caller-facing taxonomy.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("failed to hash code: {0}")]
    Hash(String),
}

impl From<sled::transaction::TransactionError<StoreError>> for StoreError {
    fn from(value: sled::transaction::TransactionError<StoreError>) -> Self {
        match value {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => StoreError::Sled(e),
        }
    }
}

impl From<StoreError> for CodeError {
    fn from(value: StoreError) -> Self {
        tracing::error!(error = %value, "storage failure, failing closed");
        CodeError::SystemError
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("index key is not valid hex: {0}")]
    IndexKey(#[from] hex::FromHexError),
    #[error("invalid hash cost: {0}")]
    HashCost(String),
    #[error("invalid policy: {0} must be greater than zero")]
    Zero(&'static str),
}
