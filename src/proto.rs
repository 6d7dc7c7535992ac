use crate::ratchet::{Chain, MessageKey, SkippedKeyStore};
use crate::{Error, RatchetState, Role, X25519PublicKey, X25519Secret};
use base64::Engine;
use prost::Message;

const SCHEMA_VERSION: u32 = 1;

/// Serialized [`RatchetState`].
///
/// Holds private key material; it must only ever be written to storage inside
/// the host's own trust boundary.
#[derive(Clone, PartialEq, Message)]
pub struct RatchetStateProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub root_key: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub sending_chain_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub receiving_chain_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub sending_key_pair: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub receiving_public_key: Option<Vec<u8>>,
    #[prost(uint32, tag = "7")]
    pub sending_counter: u32,
    #[prost(uint32, tag = "8")]
    pub receiving_counter: u32,
    #[prost(uint32, tag = "9")]
    pub previous_chain_length: u32,
    #[prost(bool, tag = "10")]
    pub is_initiator: bool,
    #[prost(bytes = "vec", optional, tag = "11")]
    pub pending_bootstrap_public_key: Option<Vec<u8>>,
    #[prost(message, optional, tag = "12")]
    pub skipped_keys: Option<SkippedKeyStoreProto>,
}

/// Skipped message keys, oldest first.
#[derive(Clone, PartialEq, Message)]
pub struct SkippedKeyStoreProto {
    #[prost(uint64, tag = "1")]
    pub capacity: u64,
    #[prost(uint32, tag = "2")]
    pub high_water_percent: u32,
    #[prost(uint32, tag = "3")]
    pub low_water_percent: u32,
    #[prost(message, repeated, tag = "4")]
    pub keys: Vec<SkippedKeyProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SkippedKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub message_index: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub message_key: Vec<u8>,
}

/// Serialized [`Session`](crate::Session).
#[derive(Clone, PartialEq, Message)]
pub struct SessionProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(message, optional, tag = "3")]
    pub state: Option<RatchetStateProto>,
}

/// Converts ratchet state to and from its storage record.
///
/// Message keys that were used are already gone from the state, so they are
/// never written. Cached keys of skipped messages are.
pub struct SessionCodec;

impl SessionCodec {
    /// Encode the state to Protocol Buffers format
    pub fn encode(state: &RatchetState) -> Vec<u8> {
        Self::to_proto(state).encode_to_vec()
    }

    /// Decode a state from Protocol Buffers format
    pub fn decode(bytes: &[u8]) -> Result<RatchetState, Error> {
        let proto = RatchetStateProto::decode(bytes)
            .map_err(|err| Error::Serde(format!("Failed to decode ratchet state: {err:?}")))?;
        Self::from_proto(proto)
    }

    /// [`SessionCodec::encode`] as standard base64 text.
    pub fn encode_base64(state: &RatchetState) -> String {
        base64::engine::general_purpose::STANDARD.encode(Self::encode(state))
    }

    /// Inverse of [`SessionCodec::encode_base64`].
    pub fn decode_base64(text: &str) -> Result<RatchetState, Error> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(text)?;
        Self::decode(&bytes)
    }

    pub(crate) fn to_proto(state: &RatchetState) -> RatchetStateProto {
        let keys = state
            .skipped_keys
            .iter()
            .map(|((public_key, message_index), message_key)| SkippedKeyProto {
                public_key: public_key.to_vec(),
                message_index: *message_index,
                message_key: message_key.as_bytes().to_vec(),
            })
            .collect();

        let skipped_keys = SkippedKeyStoreProto {
            capacity: state.skipped_keys.capacity() as u64,
            high_water_percent: percent_to_proto(state.skipped_keys.high_water_percent()),
            low_water_percent: percent_to_proto(state.skipped_keys.low_water_percent()),
            keys,
        };

        RatchetStateProto {
            version: SCHEMA_VERSION,
            root_key: state.root_key.to_vec(),
            sending_chain_key: state
                .sending_chain
                .as_ref()
                .map(|chain| chain.as_bytes().to_vec()),
            receiving_chain_key: state
                .receiving_chain
                .as_ref()
                .map(|chain| chain.as_bytes().to_vec()),
            sending_key_pair: state
                .sending_key_pair
                .as_ref()
                .map(|key_pair| key_pair.to_bytes().to_vec()),
            receiving_public_key: state
                .receiving_public_key
                .map(|key| key.as_bytes().to_vec()),
            sending_counter: state.sending_counter,
            receiving_counter: state.receiving_counter,
            previous_chain_length: state.previous_chain_length,
            is_initiator: state.is_initiator(),
            pending_bootstrap_public_key: state
                .pending_bootstrap_public_key
                .map(|key| key.as_bytes().to_vec()),
            skipped_keys: Some(skipped_keys),
        }
    }

    pub(crate) fn from_proto(proto: RatchetStateProto) -> Result<RatchetState, Error> {
        if proto.version != SCHEMA_VERSION {
            return Err(Error::Serde(format!(
                "Unsupported schema version: {}",
                proto.version
            )));
        }

        let store_proto = proto
            .skipped_keys
            .ok_or_else(|| Error::Serde("Missing skipped key store".to_string()))?;
        let capacity = usize::try_from(store_proto.capacity)
            .map_err(|_| Error::Serde("Invalid skipped key capacity".to_string()))?;

        let mut skipped_keys = SkippedKeyStore::new(
            capacity,
            percent_from_proto(store_proto.high_water_percent),
            percent_from_proto(store_proto.low_water_percent),
        );
        for key in store_proto.keys {
            let public_key = X25519PublicKey::try_from(key.public_key.as_slice())?;
            let message_key = secret_from_bytes(&key.message_key, "message key")?;
            skipped_keys.insert(&public_key, key.message_index, MessageKey::from(message_key));
        }

        let role = if proto.is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        };

        Ok(RatchetState {
            root_key: secret_from_bytes(&proto.root_key, "root key")?,
            sending_chain: proto
                .sending_chain_key
                .map(|key| secret_from_bytes(&key, "sending chain key").map(Chain::new))
                .transpose()?,
            receiving_chain: proto
                .receiving_chain_key
                .map(|key| secret_from_bytes(&key, "receiving chain key").map(Chain::new))
                .transpose()?,
            sending_key_pair: proto
                .sending_key_pair
                .map(|key| secret_from_bytes(&key, "ratchet key pair").map(X25519Secret::from))
                .transpose()?,
            receiving_public_key: proto
                .receiving_public_key
                .map(|key| X25519PublicKey::try_from(key.as_slice()))
                .transpose()?,
            sending_counter: proto.sending_counter,
            receiving_counter: proto.receiving_counter,
            previous_chain_length: proto.previous_chain_length,
            skipped_keys,
            role,
            pending_bootstrap_public_key: proto
                .pending_bootstrap_public_key
                .map(|key| X25519PublicKey::try_from(key.as_slice()))
                .transpose()?,
        })
    }
}

impl RatchetState {
    /// Serialize the state to Protocol Buffers format
    pub fn serialize(&self) -> Vec<u8> {
        SessionCodec::encode(self)
    }

    /// Deserialize a state from Protocol Buffers format
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        SessionCodec::decode(bytes)
    }
}

fn secret_from_bytes(bytes: &[u8], name: &str) -> Result<Box<[u8; 32]>, Error> {
    if bytes.len() != 32 {
        return Err(Error::Serde(format!("Invalid {name} length")));
    }

    let mut secret = Box::new([0u8; 32]);
    secret.copy_from_slice(bytes);
    Ok(secret)
}

fn percent_to_proto(percent: usize) -> u32 {
    u32::try_from(percent).unwrap_or(100)
}

fn percent_from_proto(percent: u32) -> usize {
    usize::try_from(percent).unwrap_or(100)
}
