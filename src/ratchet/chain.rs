use crate::Error;
use crate::crypto::hmac_step;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// Single-use symmetric key for one message. Wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKey(Box<[u8; 32]>);

impl MessageKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<Box<[u8; 32]>> for MessageKey {
    fn from(key: Box<[u8; 32]>) -> Self {
        Self(key)
    }
}

/// Symmetric-key ratchet chain for deriving message keys
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Chain {
    chain_key: Box<[u8; 32]>,
}

impl Chain {
    pub(crate) fn new(chain_key: Box<[u8; 32]>) -> Self {
        Self { chain_key }
    }

    /// Message key for the current position, without advancing.
    pub(crate) fn message_key(&self) -> Result<MessageKey, Error> {
        hmac_step(&self.chain_key, MESSAGE_KEY_SEED).map(MessageKey)
    }

    /// Replaces the chain key with its successor.
    pub(crate) fn advance(&mut self) -> Result<(), Error> {
        let mut next = hmac_step(&self.chain_key, CHAIN_KEY_SEED)?;
        self.chain_key.copy_from_slice(next.as_slice());
        next.zeroize();
        Ok(())
    }

    /// Returns the current message key and advances the chain.
    pub(crate) fn step(&mut self) -> Result<MessageKey, Error> {
        let message_key = self.message_key()?;
        self.advance()?;
        Ok(message_key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.chain_key
    }
}
