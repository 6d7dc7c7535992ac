use crate::crypto::{CryptoProvider, StandardProvider};
use crate::proto::{SessionCodec, SessionProto};
use crate::{Error, MessageEnvelope, RatchetEngine, RatchetState, X25519PublicKey};
use prost::Message;
use std::sync::{Arc, Mutex};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SCHEMA_VERSION: u32 = 1;

/// A secure messaging session with one peer.
///
/// Owns the ratchet state of the conversation together with the engine that
/// drives it. Every operation takes `&mut self`, so a `Session` always has a
/// single owner. Use [`SessionHandle`] to share one between threads.
pub struct Session<P = StandardProvider> {
    session_id: String,
    engine: RatchetEngine<P>,
    state: RatchetState,
}

impl<P: CryptoProvider> Session<P> {
    /// Wraps an existing ratchet state.
    pub fn new(session_id: String, engine: RatchetEngine<P>, state: RatchetState) -> Self {
        Self {
            session_id,
            engine,
            state,
        }
    }

    /// Starts an outbound session from the X3DH result.
    pub fn initiate(
        session_id: String,
        engine: RatchetEngine<P>,
        shared_secret: &[u8],
        bootstrap_public_key: Option<X25519PublicKey>,
    ) -> Result<Self, Error> {
        let state = engine.initialize_initiator(shared_secret, bootstrap_public_key)?;
        debug!(target: "pawl::session", %session_id, "created outbound session");
        Ok(Self::new(session_id, engine, state))
    }

    /// Accepts an inbound session from the X3DH result.
    pub fn respond(
        session_id: String,
        engine: RatchetEngine<P>,
        shared_secret: &[u8],
        peer_public_key: Option<X25519PublicKey>,
    ) -> Result<Self, Error> {
        let state = engine.initialize_responder(shared_secret, peer_public_key)?;
        debug!(target: "pawl::session", %session_id, "created inbound session");
        Ok(Self::new(session_id, engine, state))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &RatchetState {
        &self.state
    }

    /// Encrypts a message using this session.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<MessageEnvelope, Error> {
        self.engine.encrypt(&mut self.state, plaintext)
    }

    /// Decrypts a message using this session.
    pub fn decrypt(&mut self, envelope: &MessageEnvelope) -> Result<Vec<u8>, Error> {
        self.engine.decrypt(&mut self.state, envelope)
    }

    /// Serialize the session to Protocol Buffers format
    pub fn serialize(&self) -> Vec<u8> {
        SessionProto {
            version: SCHEMA_VERSION,
            session_id: self.session_id.clone(),
            state: Some(SessionCodec::to_proto(&self.state)),
        }
        .encode_to_vec()
    }

    /// Deserialize a session from Protocol Buffers format
    pub fn deserialize(bytes: &[u8], engine: RatchetEngine<P>) -> Result<Self, Error> {
        let proto = SessionProto::decode(bytes)
            .map_err(|err| Error::Serde(format!("Failed to decode session: {err:?}")))?;

        if proto.version != SCHEMA_VERSION {
            return Err(Error::Serde(format!(
                "Unsupported schema version: {}",
                proto.version
            )));
        }

        let state = proto
            .state
            .ok_or_else(|| Error::Serde("Missing ratchet state".to_string()))?;

        Ok(Self::new(
            proto.session_id,
            engine,
            SessionCodec::from_proto(state)?,
        ))
    }
}

impl<P> Zeroize for Session<P> {
    fn zeroize(&mut self) {
        self.session_id.zeroize();
        self.state.zeroize();
    }
}

impl<P> Drop for Session<P> {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl<P> ZeroizeOnDrop for Session<P> {}

/// A cloneable, thread-safe handle to a [`Session`].
///
/// Calls are serialized through a mutex, so concurrent senders and receivers
/// never observe or produce a half-updated ratchet state.
pub struct SessionHandle<P = StandardProvider>(Arc<Mutex<Session<P>>>);

impl<P> Clone for SessionHandle<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: CryptoProvider> SessionHandle<P> {
    pub fn new(session: Session<P>) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    /// Runs `f` with exclusive access to the session.
    pub fn with<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Session<P>) -> R,
    {
        let mut session = self
            .0
            .lock()
            .map_err(|_| Error::Session("Session lock poisoned".to_string()))?;
        Ok(f(&mut session))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<MessageEnvelope, Error> {
        self.with(|session| session.encrypt(plaintext))?
    }

    pub fn decrypt(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, Error> {
        self.with(|session| session.decrypt(envelope))?
    }

    pub fn session_id(&self) -> Result<String, Error> {
        self.with(|session| session.session_id().to_string())
    }
}

impl<P: CryptoProvider> From<Session<P>> for SessionHandle<P> {
    fn from(session: Session<P>) -> Self {
        Self::new(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RatchetConfig;
    use std::thread;

    fn create_session_pair() -> (Session, Session) {
        let engine = RatchetEngine::new(RatchetConfig::default());
        let shared_secret = [9u8; 32];

        let alice = Session::initiate(
            "alice-to-bob".to_string(),
            engine.clone(),
            &shared_secret,
            None,
        )
        .unwrap();
        let bob = Session::respond("bob-to-alice".to_string(), engine, &shared_secret, None)
            .unwrap();

        (alice, bob)
    }

    #[test]
    fn test_session() {
        let (mut alice, mut bob) = create_session_pair();

        let message = "Hello Bob, this is a secure message!";
        let envelope = alice.encrypt(message.as_bytes()).unwrap();
        let decrypted = bob.decrypt(&envelope).unwrap();
        assert_eq!(String::from_utf8(decrypted).unwrap(), message);

        let response = "Hello Alice, I received your message!";
        let envelope = bob.encrypt(response.as_bytes()).unwrap();
        let decrypted = alice.decrypt(&envelope).unwrap();
        assert_eq!(String::from_utf8(decrypted).unwrap(), response);
    }

    #[test]
    fn test_session_serialization_preserves_functionality() {
        let (mut alice, mut bob) = create_session_pair();

        let envelope = alice.encrypt(b"before serialization").unwrap();
        bob.decrypt(&envelope).unwrap();

        let engine = RatchetEngine::new(RatchetConfig::default());
        let mut bob_restored = Session::deserialize(&bob.serialize(), engine.clone()).unwrap();
        let mut alice_restored = Session::deserialize(&alice.serialize(), engine).unwrap();
        assert_eq!(bob_restored.session_id(), "bob-to-alice");

        let envelope = bob_restored.encrypt(b"after serialization").unwrap();
        assert_eq!(
            alice_restored.decrypt(&envelope).unwrap(),
            b"after serialization"
        );
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        let engine = RatchetEngine::new(RatchetConfig::default());

        let missing_state = SessionProto {
            version: SCHEMA_VERSION,
            session_id: "id".to_string(),
            state: None,
        }
        .encode_to_vec();
        assert!(Session::deserialize(&missing_state, engine.clone()).is_err());

        let (alice, _) = create_session_pair();
        let mut proto = SessionProto::decode(alice.serialize().as_slice()).unwrap();
        proto.version = 7;
        assert!(Session::deserialize(&proto.encode_to_vec(), engine).is_err());
    }

    #[test]
    fn test_handle_serializes_concurrent_senders() {
        let (alice, mut bob) = create_session_pair();
        let alice = SessionHandle::from(alice);

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let alice = alice.clone();
                thread::spawn(move || {
                    (0..10)
                        .map(|i| alice.encrypt(format!("{worker}:{i}").as_bytes()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut envelopes: Vec<_> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        envelopes.sort_by_key(|envelope| envelope.message_index);

        let indices: Vec<_> = envelopes.iter().map(|e| e.message_index).collect();
        assert_eq!(indices, (0..40).collect::<Vec<u32>>());

        for envelope in &envelopes {
            bob.decrypt(envelope).unwrap();
        }
        assert_eq!(bob.state().receiving_counter(), 40);
        assert_eq!(alice.session_id().unwrap(), "alice-to-bob");
    }
}
