use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("mining exhausted for block {block_number} after {attempts} attempts")]
    MiningExhausted { block_number: u64, attempts: u64 },

    #[error("write conflict appending block {block_number}: {reason}")]
    WriteConflict { block_number: u64, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tamper detected at block {block_number}: {detail}")]
    TamperDetected { block_number: u64, detail: String },

    #[error("payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("ledger store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LedgerError {
    /// Whether the same call may succeed if simply repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::MiningExhausted { .. }
                | LedgerError::WriteConflict { .. }
                | LedgerError::StoreUnavailable(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::MiningExhausted { .. } => "mining_exhausted",
            LedgerError::WriteConflict { .. } => "write_conflict",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::TamperDetected { .. } => "tamper_detected",
            LedgerError::Serialization(_) => "serialization_error",
            LedgerError::InvalidInput(_) => "invalid_input",
            LedgerError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        LedgerError::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
