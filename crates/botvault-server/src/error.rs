use botvault_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("network error: {0}")]
    Network(String),

    #[error("unknown bot: {0}")]
    UnknownBot(String),

    #[error("health check failed: {0}")]
    HealthCheck(String),
}

impl ServerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Crypto(e) => e.is_retryable(),
            Self::Network(_) => true,
            Self::UnknownBot(_) | Self::HealthCheck(_) => false,
        }
    }
}
