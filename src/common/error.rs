//! Unified error type for the account subsystem.

use thiserror::Error;

/// Root error type for the account subsystem.
#[derive(Debug, Error)]
pub enum Error {
    /// Password prompt collaborator failed or returned unusable data.
    #[error("password callback failed: {0}")]
    Callback(String),

    /// Ciphertext present but decryption failed (wrong password, or
    /// unlock retries exhausted).
    #[error("failed to unlock master secret: {0}")]
    Unlock(String),

    /// BIP32/BIP39 math refused the operation.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// A subaccount's generated index would exceed 2^31.
    #[error("account full: cannot generate past index {0}")]
    AccountFull(u32),

    /// Caller referenced a subchain or index that does not exist.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// `reserve` found no acceptable index within the gap limit and the
    /// maximum index.
    #[error("reservation exhausted: {0}")]
    Exhausted(String),

    /// Funding a transaction proposal failed (unsupported output shape,
    /// insufficient UTXOs).
    #[error("failed to build funding transaction: {0}")]
    BuildFunding(String),

    /// Signing a transaction failed (sighash, key mismatch).
    #[error("failed to sign transaction: {0}")]
    BuildSign(String),

    /// Storage backend refused a read or write.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Malformed mnemonic, unsupported PKT version, unsupported
    /// payment-code version, or bad key size.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors.
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),
}

impl Error {
    pub fn callback(msg: impl Into<String>) -> Self {
        Self::Callback(msg.into())
    }

    pub fn unlock(msg: impl Into<String>) -> Self {
        Self::Unlock(msg.into())
    }

    pub fn key_derivation(msg: impl Into<String>) -> Self {
        Self::KeyDerivation(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::Exhausted(msg.into())
    }

    pub fn build_funding(msg: impl Into<String>) -> Self {
        Self::BuildFunding(msg.into())
    }

    pub fn build_sign(msg: impl Into<String>) -> Self {
        Self::BuildSign(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether a caller may usefully retry the operation unchanged (e.g.
    /// after a transient storage hiccup), as opposed to errors that
    /// require different input or state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Callback(_))
    }

    /// Stable machine-readable code, for surfacing through API layers
    /// built on top of this crate.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Callback(_) => "CALLBACK_ERROR",
            Error::Unlock(_) => "UNLOCK_ERROR",
            Error::KeyDerivation(_) => "KEY_DERIVATION_ERROR",
            Error::AccountFull(_) => "ACCOUNT_FULL",
            Error::OutOfRange(_) => "OUT_OF_RANGE",
            Error::Exhausted(_) => "EXHAUSTED",
            Error::BuildFunding(_) => "BUILD_FUNDING_ERROR",
            Error::BuildSign(_) => "BUILD_SIGN_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Logging(_) => "LOGGING_ERROR",
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::key_derivation("normal derivation on ed25519");
        assert!(err.to_string().contains("ed25519"));
        assert_eq!(err.error_code(), "KEY_DERIVATION_ERROR");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(!Error::invalid_input("bad mnemonic").is_retryable());
        assert!(Error::callback("no prompt handler").is_retryable());
    }

    #[test]
    fn test_account_full_carries_index() {
        let err = Error::AccountFull(1 << 31);
        assert_eq!(err.error_code(), "ACCOUNT_FULL");
        assert!(err.to_string().contains("2147483648"));
    }
}
