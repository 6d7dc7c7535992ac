mod types;
pub use types::*;

mod crypto;
pub use crypto::{CryptoProvider, NONCE_SIZE, StandardProvider, TAG_SIZE};

mod ratchet;
pub use ratchet::*;

mod proto;
pub use proto::*;

mod error;
pub use error::Error;

mod config;
pub use config::RatchetConfig;

mod session;
pub use session::*;
