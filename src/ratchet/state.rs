use crate::ratchet::chain::Chain;
use crate::ratchet::skipped::SkippedKeyStore;
use crate::{X25519PublicKey, X25519Secret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Which side of the key agreement this session is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Started the X3DH exchange and sends first.
    Initiator,
    /// Answered the X3DH exchange and must receive before sending.
    Responder,
}

/// The mutable record of one Double Ratchet session.
///
/// A state has exactly one owner at a time. The engine never locks it; wrap it
/// in a [`SessionHandle`](crate::SessionHandle) to share it between threads.
#[derive(Clone)]
pub struct RatchetState {
    pub(crate) root_key: Box<[u8; 32]>,

    pub(crate) sending_chain: Option<Chain>,
    pub(crate) receiving_chain: Option<Chain>,

    pub(crate) sending_key_pair: Option<X25519Secret>,
    pub(crate) receiving_public_key: Option<X25519PublicKey>,

    // Message counters
    pub(crate) sending_counter: u32,
    pub(crate) receiving_counter: u32,
    pub(crate) previous_chain_length: u32,

    pub(crate) skipped_keys: SkippedKeyStore,

    pub(crate) role: Role,
    pub(crate) pending_bootstrap_public_key: Option<X25519PublicKey>,
}

impl RatchetState {
    /// Our current ratchet public key, once a key pair exists.
    pub fn public_key(&self) -> Option<X25519PublicKey> {
        self.sending_key_pair.as_ref().map(X25519Secret::public_key)
    }

    /// The last ratchet public key seen from the peer.
    pub fn receiving_public_key(&self) -> Option<X25519PublicKey> {
        self.receiving_public_key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_initiator(&self) -> bool {
        self.role == Role::Initiator
    }

    /// Index the next outgoing message will carry.
    pub fn sending_counter(&self) -> u32 {
        self.sending_counter
    }

    /// Index the next in-order incoming message is expected to carry.
    pub fn receiving_counter(&self) -> u32 {
        self.receiving_counter
    }

    pub fn previous_chain_length(&self) -> u32 {
        self.previous_chain_length
    }

    /// Number of cached keys for messages that have not arrived yet.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped_keys.len()
    }

    pub fn has_sending_chain(&self) -> bool {
        self.sending_chain.is_some()
    }

    pub fn has_receiving_chain(&self) -> bool {
        self.receiving_chain.is_some()
    }

    /// The X3DH ephemeral key still waiting to be attached to our first message.
    pub fn pending_bootstrap_public_key(&self) -> Option<X25519PublicKey> {
        self.pending_bootstrap_public_key
    }

    /// Copies the keys and counters, leaving the skipped-key cache empty.
    pub(crate) fn clone_without_skipped_keys(&self) -> Self {
        Self {
            root_key: self.root_key.clone(),
            sending_chain: self.sending_chain.clone(),
            receiving_chain: self.receiving_chain.clone(),
            sending_key_pair: self.sending_key_pair.clone(),
            receiving_public_key: self.receiving_public_key,
            sending_counter: self.sending_counter,
            receiving_counter: self.receiving_counter,
            previous_chain_length: self.previous_chain_length,
            skipped_keys: self.skipped_keys.empty_like(),
            role: self.role,
            pending_bootstrap_public_key: self.pending_bootstrap_public_key,
        }
    }

    pub(crate) fn set_sending_chain(&mut self, chain_key: Box<[u8; 32]>) {
        self.sending_chain = Some(Chain::new(chain_key));
        self.sending_counter = 0;
    }

    pub(crate) fn set_receiving_chain(&mut self, chain_key: Box<[u8; 32]>) {
        self.receiving_chain = Some(Chain::new(chain_key));
        self.receiving_counter = 0;
    }
}

impl Zeroize for RatchetState {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        self.sending_chain.zeroize();
        self.receiving_chain.zeroize();
        self.sending_key_pair.zeroize();
        self.skipped_keys = self.skipped_keys.empty_like();
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for RatchetState {}
