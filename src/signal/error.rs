use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("no session for {0}")]
    NoSession(String),
    #[error("no sender key state for {0}")]
    NoSenderKeyState(String),
    #[error("invalid signal message: {0}")]
    InvalidMessage(&'static str),
    #[error("message mac verification failed")]
    BadMac,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("signed pre-key signature verification failed")]
    BadSignedPreKeySignature,
    #[error("pre-key {0} not found in store")]
    MissingPreKey(u32),
    #[error("signed pre-key {0} not found in store")]
    MissingSignedPreKey(u32),
    #[error("message counter {0} too far in the future")]
    CounterTooFar(u32),
    #[error("duplicate message: counter {0} already consumed")]
    DuplicateMessage(u32),
    #[error("protobuf decode failed: {0}")]
    Proto(#[from] prost::DecodeError),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("store failure: {0}")]
    Storage(String),
}

impl SignalError {
    /// Failures that mean the sender used key material we no longer hold;
    /// the receiver pipeline NACKs these instead of requesting a retry.
    pub fn is_missing_keys(&self) -> bool {
        matches!(
            self,
            SignalError::MissingPreKey(_) | SignalError::MissingSignedPreKey(_)
        )
    }
}

impl From<crate::crypto::cbc::CbcError> for SignalError {
    fn from(e: crate::crypto::cbc::CbcError) -> Self {
        SignalError::Cipher(e.to_string())
    }
}

pub type SignalResult<T> = std::result::Result<T, SignalError>;
