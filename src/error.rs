/// Errors that can occur during Double Ratchet operations.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The session has no sending chain yet and cannot derive one.
    #[error("No sending chain key available")]
    NoSendingChainKey,

    /// A message arrived for a receiving chain that was never derived.
    #[error("No receiving chain key available")]
    NoReceivingChainKey,

    /// The message index is behind the receiving chain and no skipped key exists for it.
    #[error("Message number mismatch: expected {expected}, received {received}")]
    MessageNumberMismatch { expected: u32, received: u32 },

    /// Accepting the message would require caching more skipped keys than allowed.
    #[error("Too many skipped messages: {requested} requested, limit is {limit}")]
    TooManySkippedKeys { requested: u32, limit: u32 },

    /// The peer's ratchet public key is a low-order point. The message should be
    /// dropped; the session is still usable.
    #[error("Invalid peer public key")]
    InvalidPublicKey,

    /// The AEAD tag did not verify.
    #[error("Message authentication failed")]
    AuthenticationFailure,

    /// A key derivation primitive failed. The session should be discarded.
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailure(String),

    /// A cryptographic operation failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),

    /// Session is in an unusable state.
    #[error("Session state error: {0}")]
    Session(String),
}

impl From<hkdf::InvalidLength> for Error {
    fn from(value: hkdf::InvalidLength) -> Self {
        Self::KeyDerivationFailure(value.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}
