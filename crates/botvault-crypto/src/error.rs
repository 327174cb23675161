use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("crypto engine already open for {0}")]
    AlreadyOpen(String),

    #[error("invalid prekey range: {0}")]
    InvalidRange(String),

    #[error("session error: {0}")]
    SessionError(String),

    #[error("decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("crypto engine for {0} is closed")]
    EngineClosed(String),
}

impl CryptoError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::AlreadyOpen(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(CryptoError::StorageUnavailable("disk".into()).is_retryable());
        assert!(CryptoError::AlreadyOpen("bot".into()).is_retryable());
        assert!(!CryptoError::DecryptionFailure("tag".into()).is_retryable());
        assert!(!CryptoError::SessionError("corrupt".into()).is_retryable());
        assert!(!CryptoError::InvalidRange("count".into()).is_retryable());
    }
}
