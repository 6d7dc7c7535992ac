mod chain;
mod envelope;
mod skipped;
mod state;

use crate::crypto::{CryptoProvider, StandardProvider, derive_root_key, kdf_rk};
use crate::error::Error;
pub(crate) use crate::ratchet::chain::{Chain, MessageKey};
pub(crate) use crate::ratchet::envelope::AD_SIZE;
pub use crate::ratchet::envelope::MessageEnvelope;
pub(crate) use crate::ratchet::skipped::{SkippedKeyStore, StagedSkippedKeys};
pub use crate::ratchet::state::{RatchetState, Role};
use crate::{RatchetConfig, X25519PublicKey};
use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};
use zeroize::Zeroize;

const LOG_TARGET: &str = "pawl::ratchet";

thread_local! {
    static AD_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(AD_SIZE));
}

fn with_ad_buffer<F, R>(f: F) -> R
where
    F: FnOnce(&mut Vec<u8>) -> R,
{
    AD_BUFFER.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.clear();
        f(&mut buffer)
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Double Ratchet engine.
///
/// Turns the shared secret of an X3DH key agreement into a stream of
/// single-use message keys. The Diffie-Hellman ratchet provides forward
/// secrecy (compromise of current keys does not expose past messages) and
/// break-in recovery (a compromise stops mattering after the next ratchet
/// step). Out-of-order delivery is handled by caching the keys of skipped
/// messages in a bounded store.
///
/// The engine itself holds no session data; every operation works on a
/// caller-owned [`RatchetState`].
#[derive(Clone, Debug)]
pub struct RatchetEngine<P = StandardProvider> {
    provider: P,
    config: RatchetConfig,
}

impl RatchetEngine {
    /// An engine backed by X25519, AES-256-GCM and the OS RNG.
    pub fn new(config: RatchetConfig) -> Self {
        Self::with_provider(StandardProvider, config)
    }
}

impl Default for RatchetEngine {
    fn default() -> Self {
        Self::new(RatchetConfig::default())
    }
}

impl<P: CryptoProvider> RatchetEngine<P> {
    /// An engine using injected primitives.
    pub fn with_provider(provider: P, config: RatchetConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    /// Creates the state for a new session.
    ///
    /// The initiator can encrypt straight away. The responder has to decrypt
    /// the initiator's first message before it can send.
    ///
    /// `peer_public_key` is only used by the responder and
    /// `bootstrap_public_key` only by the initiator.
    pub fn initialize(
        &self,
        shared_secret: &[u8],
        role: Role,
        peer_public_key: Option<X25519PublicKey>,
        bootstrap_public_key: Option<X25519PublicKey>,
    ) -> Result<RatchetState, Error> {
        if shared_secret.len() < 32 {
            return Err(Error::KeyDerivationFailure(
                "Shared secret must be at least 32 bytes".to_string(),
            ));
        }

        let root_key = derive_root_key(shared_secret, &self.config.root_key_info)?;

        let mut state = RatchetState {
            root_key,
            sending_chain: None,
            receiving_chain: None,
            sending_key_pair: None,
            receiving_public_key: None,
            sending_counter: 0,
            receiving_counter: 0,
            previous_chain_length: 0,
            skipped_keys: SkippedKeyStore::new(
                self.config.max_skipped_keys,
                self.config.eviction_high_water_percent,
                self.config.eviction_low_water_percent,
            ),
            role,
            pending_bootstrap_public_key: None,
        };

        match role {
            Role::Initiator => {
                state.sending_key_pair = Some(self.provider.generate_key_pair()?);
                state.pending_bootstrap_public_key = bootstrap_public_key;

                // No DH output exists yet, only the X3DH secret
                let (root_key, chain_key) =
                    kdf_rk(None, state.root_key.as_slice(), &self.config.chain_key_info)?;
                state.root_key = root_key;
                state.set_sending_chain(chain_key);
            }
            Role::Responder => {
                state.receiving_public_key = peer_public_key;
            }
        }

        debug!(target: LOG_TARGET, ?role, "initialized ratchet session");

        Ok(state)
    }

    /// Shorthand for [`RatchetEngine::initialize`] on the initiating side.
    pub fn initialize_initiator(
        &self,
        shared_secret: &[u8],
        bootstrap_public_key: Option<X25519PublicKey>,
    ) -> Result<RatchetState, Error> {
        self.initialize(shared_secret, Role::Initiator, None, bootstrap_public_key)
    }

    /// Shorthand for [`RatchetEngine::initialize`] on the responding side.
    pub fn initialize_responder(
        &self,
        shared_secret: &[u8],
        peer_public_key: Option<X25519PublicKey>,
    ) -> Result<RatchetState, Error> {
        self.initialize(shared_secret, Role::Responder, peer_public_key, None)
    }

    /// Encrypts a message using the Double Ratchet algorithm.
    ///
    /// This performs the following steps:
    /// 1. Derives the responder's sending chain if it has not been derived yet
    /// 2. Derives the message key from the sending chain
    /// 3. Encrypts the message, authenticating the envelope header fields
    /// 4. Advances the sending chain and its counter
    pub fn encrypt(
        &self,
        state: &mut RatchetState,
        plaintext: &[u8],
    ) -> Result<MessageEnvelope, Error> {
        if state.sending_chain.is_none() {
            self.derive_deferred_sending_chain(state)?;
        }

        let sender_public_key = state.public_key().ok_or(Error::NoSendingChainKey)?;
        let message_index = state.sending_counter;
        let next_counter = message_index
            .checked_add(1)
            .ok_or_else(|| Error::Session("Sending chain exhausted".to_string()))?;

        let bootstrap_public_key = if state.is_initiator() && message_index == 0 {
            state.pending_bootstrap_public_key
        } else {
            None
        };

        let mut envelope = MessageEnvelope {
            sender_public_key,
            message_index,
            previous_chain_length: state.previous_chain_length,
            ciphertext: Vec::new(),
            nonce: self.provider.nonce()?,
            bootstrap_public_key,
            timestamp: now_millis(),
        };

        let chain = state
            .sending_chain
            .as_mut()
            .ok_or(Error::NoSendingChainKey)?;
        let message_key = chain.message_key()?;

        envelope.ciphertext = with_ad_buffer(|buffer| {
            envelope.write_associated_data(buffer);
            self.provider.seal(
                message_key.as_bytes(),
                &envelope.nonce,
                buffer,
                plaintext,
            )
        })?;
        drop(message_key);

        chain.advance()?;
        state.sending_counter = next_counter;

        trace!(
            target: LOG_TARGET,
            message_index,
            previous_chain_length = envelope.previous_chain_length,
            "encrypted message"
        );

        Ok(envelope)
    }

    /// Responder's first sending chain, derived lazily on the first reply.
    fn derive_deferred_sending_chain(&self, state: &mut RatchetState) -> Result<(), Error> {
        let (Some(key_pair), Some(receiving_public_key)) =
            (&state.sending_key_pair, &state.receiving_public_key)
        else {
            return Err(Error::NoSendingChainKey);
        };
        if state.is_initiator() {
            return Err(Error::NoSendingChainKey);
        }

        let mut dh_output = self.provider.agree(key_pair, receiving_public_key)?;
        let derived = kdf_rk(
            Some(&*state.root_key),
            dh_output.as_slice(),
            &self.config.chain_key_info,
        );
        dh_output.zeroize();
        let (root_key, chain_key) = derived?;

        state.root_key = root_key;
        state.set_sending_chain(chain_key);
        state.previous_chain_length = state.receiving_counter;

        debug!(
            target: LOG_TARGET,
            previous_chain_length = state.previous_chain_length,
            "derived deferred sending chain"
        );

        Ok(())
    }

    /// Decrypts a message using the Double Ratchet algorithm.
    ///
    /// This performs the following steps:
    /// 1. Uses a cached key if the message was skipped earlier
    /// 2. Performs a DH ratchet step if the sender's ratchet key changed
    /// 3. Caches the keys of any messages skipped over in the receiving chain
    /// 4. Derives the message key and decrypts the message
    ///
    /// The state is only updated if the message authenticates. On any error the
    /// state is left exactly as it was.
    pub fn decrypt(
        &self,
        state: &mut RatchetState,
        envelope: &MessageEnvelope,
    ) -> Result<Vec<u8>, Error> {
        // Work on a copy of the keys and stage skipped-key changes, so that a
        // rejected message cannot advance the session
        let mut working = state.clone_without_skipped_keys();
        let mut staged = StagedSkippedKeys::default();
        let plaintext =
            self.decrypt_in_place(&mut working, &state.skipped_keys, &mut staged, envelope)?;

        std::mem::swap(&mut working.skipped_keys, &mut state.skipped_keys);
        working.skipped_keys.commit(staged);
        *state = working;

        Ok(plaintext)
    }

    fn decrypt_in_place(
        &self,
        state: &mut RatchetState,
        skipped_keys: &SkippedKeyStore,
        staged: &mut StagedSkippedKeys,
        envelope: &MessageEnvelope,
    ) -> Result<Vec<u8>, Error> {
        let message_key = match staged.take(
            skipped_keys,
            &envelope.sender_public_key,
            envelope.message_index,
        ) {
            Some(message_key) => {
                trace!(
                    target: LOG_TARGET,
                    message_index = envelope.message_index,
                    "using skipped message key"
                );
                message_key
            }
            None => self.receiving_message_key(state, skipped_keys, staged, envelope)?,
        };

        let result = with_ad_buffer(|buffer| {
            envelope.write_associated_data(buffer);
            self.provider.open(
                message_key.as_bytes(),
                &envelope.nonce,
                buffer,
                &envelope.ciphertext,
            )
        });
        drop(message_key);

        result.inspect_err(|err| {
            warn!(
                target: LOG_TARGET,
                message_index = envelope.message_index,
                %err,
                "rejected message"
            );
        })
    }

    fn receiving_message_key(
        &self,
        state: &mut RatchetState,
        skipped_keys: &SkippedKeyStore,
        staged: &mut StagedSkippedKeys,
        envelope: &MessageEnvelope,
    ) -> Result<MessageKey, Error> {
        if state.receiving_public_key.as_ref() != Some(&envelope.sender_public_key) {
            // Keys below the receiving counter on the old chain are already in
            // the skipped store, so switching chains loses nothing we derived.
            self.dh_ratchet(state, &envelope.sender_public_key)?;
        }

        if envelope.message_index > state.receiving_counter {
            self.skip_message_keys(state, staged, envelope.message_index)?;
        }

        if envelope.message_index != state.receiving_counter {
            return staged
                .take(
                    skipped_keys,
                    &envelope.sender_public_key,
                    envelope.message_index,
                )
                .ok_or(Error::MessageNumberMismatch {
                    expected: state.receiving_counter,
                    received: envelope.message_index,
                });
        }

        let next_counter = state
            .receiving_counter
            .checked_add(1)
            .ok_or_else(|| Error::Session("Receiving chain exhausted".to_string()))?;
        let chain = state
            .receiving_chain
            .as_mut()
            .ok_or(Error::NoReceivingChainKey)?;
        let message_key = chain.step()?;
        state.receiving_counter = next_counter;

        Ok(message_key)
    }

    /// Performs a Diffie-Hellman ratchet step towards a new peer public key.
    fn dh_ratchet(
        &self,
        state: &mut RatchetState,
        peer_public_key: &X25519PublicKey,
    ) -> Result<(), Error> {
        let old_receiving_counter = state.receiving_counter;
        let old_previous_chain_length = state.previous_chain_length;

        // The responder's first receive mirrors the initiator's bootstrap derivation
        if state.role == Role::Responder
            && state.receiving_chain.is_none()
            && old_receiving_counter == 0
            && old_previous_chain_length == 0
        {
            let (root_key, chain_key) =
                kdf_rk(None, state.root_key.as_slice(), &self.config.chain_key_info)?;
            state.root_key = root_key;
            state.set_receiving_chain(chain_key);

            // The sending chain is derived on our first reply
            state.sending_key_pair = Some(self.provider.generate_key_pair()?);
            state.receiving_public_key = Some(*peer_public_key);

            debug!(target: LOG_TARGET, "derived bootstrap receiving chain");
            return Ok(());
        }

        // Every key of the old receiving chain below the counter is already
        // cached or consumed, so there is nothing left to flush from it.
        state.previous_chain_length = old_receiving_counter;
        state.receiving_public_key = Some(*peer_public_key);
        state.receiving_counter = 0;

        let key_pair = match state.sending_key_pair.take() {
            Some(key_pair) => key_pair,
            None => {
                warn!(
                    target: LOG_TARGET,
                    "ratchet key pair missing during ratchet step, generating one"
                );
                self.provider.generate_key_pair()?
            }
        };

        // Derive new receiving chain
        let mut dh_output = self.provider.agree(&key_pair, peer_public_key)?;
        let derived = kdf_rk(
            Some(&*state.root_key),
            dh_output.as_slice(),
            &self.config.chain_key_info,
        );
        dh_output.zeroize();
        let (root_key, chain_key) = derived?;
        state.root_key = root_key;
        state.set_receiving_chain(chain_key);
        drop(key_pair);

        // Generate new DH key pair and derive new sending chain
        let key_pair = self.provider.generate_key_pair()?;
        let mut dh_output = self.provider.agree(&key_pair, peer_public_key)?;
        let derived = kdf_rk(
            Some(&*state.root_key),
            dh_output.as_slice(),
            &self.config.chain_key_info,
        );
        dh_output.zeroize();
        let (root_key, chain_key) = derived?;
        state.root_key = root_key;
        state.set_sending_chain(chain_key);
        state.sending_key_pair = Some(key_pair);

        if state.is_initiator() {
            state.pending_bootstrap_public_key = None;
        }

        debug!(
            target: LOG_TARGET,
            previous_chain_length = state.previous_chain_length,
            "performed DH ratchet step"
        );

        Ok(())
    }

    /// Generates and stores skipped message keys.
    ///
    /// When receiving a message with a higher index than expected, the keys of
    /// every message in between are cached so they can still be decrypted when
    /// they arrive.
    fn skip_message_keys(
        &self,
        state: &mut RatchetState,
        staged: &mut StagedSkippedKeys,
        until: u32,
    ) -> Result<(), Error> {
        let requested = until.saturating_sub(state.receiving_counter);
        if requested == 0 {
            return Ok(());
        }

        if requested > self.config.max_skip {
            warn!(
                target: LOG_TARGET,
                requested,
                limit = self.config.max_skip,
                "refusing to skip message keys"
            );
            return Err(Error::TooManySkippedKeys {
                requested,
                limit: self.config.max_skip,
            });
        }

        let receiving_public_key = state
            .receiving_public_key
            .ok_or(Error::NoReceivingChainKey)?;
        let chain = state
            .receiving_chain
            .as_mut()
            .ok_or(Error::NoReceivingChainKey)?;

        while state.receiving_counter < until {
            let message_key = chain.step()?;
            staged.insert(&receiving_public_key, state.receiving_counter, message_key);
            state.receiving_counter += 1;
        }

        trace!(
            target: LOG_TARGET,
            skipped = requested,
            staged = staged.len(),
            "skipped message keys"
        );

        Ok(())
    }
}
