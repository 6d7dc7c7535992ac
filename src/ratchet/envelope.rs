use crate::crypto::{NONCE_SIZE, TAG_SIZE};
use crate::{Error, X25519PublicKey};

/// Length of the associated data bound into every message tag.
pub(crate) const AD_SIZE: usize = 32 + 4 + 4;

// Fixed-size prefix of the wire encoding, up to and including the bootstrap flag.
const FIXED_HEADER_SIZE: usize = 32 + 4 + 4 + NONCE_SIZE + 8 + 1;

const NO_BOOTSTRAP_KEY: u8 = 0;
const HAS_BOOTSTRAP_KEY: u8 = 1;

/// An encrypted message produced by [`RatchetEngine::encrypt`](crate::RatchetEngine::encrypt).
///
/// `sender_public_key`, `message_index` and `previous_chain_length` are
/// authenticated by the AEAD tag; `timestamp` and `bootstrap_public_key` are not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// The sender's current ratchet public key.
    pub sender_public_key: X25519PublicKey,
    /// Position of this message in the sender's current chain.
    pub message_index: u32,
    /// Previous chain length recorded by the sender when this chain started.
    pub previous_chain_length: u32,
    /// AEAD ciphertext with the tag appended.
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    /// X3DH ephemeral key, only present on the initiator's first message.
    pub bootstrap_public_key: Option<X25519PublicKey>,
    /// Milliseconds since the Unix epoch. Advisory only.
    pub timestamp: u64,
}

impl MessageEnvelope {
    /// Writes the associated data: `sender key ‖ LE32(index) ‖ LE32(previous chain length)`.
    pub(crate) fn write_associated_data(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(self.sender_public_key.as_bytes());
        buffer.extend_from_slice(&self.message_index.to_le_bytes());
        buffer.extend_from_slice(&self.previous_chain_length.to_le_bytes());
    }

    /// Serializes the envelope for transport.
    ///
    /// Format: [sender key (32)][index (4)][previous chain length (4)][nonce (12)]
    /// [timestamp (8)][bootstrap flag (1)][bootstrap key (32, if flagged)][ciphertext]
    pub fn to_bytes(&self) -> Vec<u8> {
        let bootstrap_len = if self.bootstrap_public_key.is_some() { 32 } else { 0 };
        let mut result =
            Vec::with_capacity(FIXED_HEADER_SIZE + bootstrap_len + self.ciphertext.len());

        result.extend_from_slice(self.sender_public_key.as_bytes());
        result.extend_from_slice(&self.message_index.to_be_bytes());
        result.extend_from_slice(&self.previous_chain_length.to_be_bytes());
        result.extend_from_slice(&self.nonce);
        result.extend_from_slice(&self.timestamp.to_be_bytes());

        match &self.bootstrap_public_key {
            Some(key) => {
                result.push(HAS_BOOTSTRAP_KEY);
                result.extend_from_slice(key.as_bytes());
            }
            None => result.push(NO_BOOTSTRAP_KEY),
        }

        result.extend_from_slice(&self.ciphertext);

        result
    }

    /// Deserializes an envelope produced by [`MessageEnvelope::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < FIXED_HEADER_SIZE {
            return Err(Error::Serde("Envelope too short".to_string()));
        }

        let mut sender_bytes = [0u8; 32];
        sender_bytes.copy_from_slice(&bytes[0..32]);

        let mut index_bytes = [0u8; 4];
        index_bytes.copy_from_slice(&bytes[32..36]);

        let mut pn_bytes = [0u8; 4];
        pn_bytes.copy_from_slice(&bytes[36..40]);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[40..52]);

        let mut timestamp_bytes = [0u8; 8];
        timestamp_bytes.copy_from_slice(&bytes[52..60]);

        let (bootstrap_public_key, body) = match bytes[60] {
            NO_BOOTSTRAP_KEY => (None, &bytes[FIXED_HEADER_SIZE..]),
            HAS_BOOTSTRAP_KEY => {
                if bytes.len() < FIXED_HEADER_SIZE + 32 {
                    return Err(Error::Serde("Truncated bootstrap key".to_string()));
                }
                let key = X25519PublicKey::try_from(&bytes[FIXED_HEADER_SIZE..FIXED_HEADER_SIZE + 32])?;
                (Some(key), &bytes[FIXED_HEADER_SIZE + 32..])
            }
            flag => {
                return Err(Error::Serde(format!("Unknown bootstrap flag: {flag}")));
            }
        };

        if body.len() < TAG_SIZE {
            return Err(Error::Serde("Ciphertext shorter than tag".to_string()));
        }

        Ok(Self {
            sender_public_key: X25519PublicKey::from(sender_bytes),
            message_index: u32::from_be_bytes(index_bytes),
            previous_chain_length: u32::from_be_bytes(pn_bytes),
            ciphertext: body.to_vec(),
            nonce,
            bootstrap_public_key,
            timestamp: u64::from_be_bytes(timestamp_bytes),
        })
    }
}
