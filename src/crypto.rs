use crate::{Error, X25519PublicKey, X25519Secret};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

/// AES-GCM uses 12-byte (96-bit) nonces
pub const NONCE_SIZE: usize = 12;

/// Length of the AES-GCM authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// The primitives a [`RatchetEngine`](crate::RatchetEngine) delegates to.
///
/// Every method is synchronous and CPU bound. The engine calls at most one of
/// them at a time for a given session.
pub trait CryptoProvider {
    /// Generates a fresh ratchet key pair.
    fn generate_key_pair(&self) -> Result<X25519Secret, Error>;

    /// Diffie-Hellman agreement between our secret and a peer public key.
    ///
    /// Fails with [`Error::InvalidPublicKey`] if the peer key is a low-order point.
    fn agree(
        &self,
        secret: &X25519Secret,
        public_key: &X25519PublicKey,
    ) -> Result<Box<[u8; 32]>, Error>;

    /// Returns a fresh random AEAD nonce.
    fn nonce(&self) -> Result<[u8; NONCE_SIZE], Error>;

    /// AEAD encryption. Returns ciphertext with the tag appended.
    fn seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// AEAD decryption. Must return [`Error::AuthenticationFailure`] on a bad tag
    /// and never any partial plaintext.
    fn open(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// X25519, AES-256-GCM and the operating system RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardProvider;

impl CryptoProvider for StandardProvider {
    fn generate_key_pair(&self) -> Result<X25519Secret, Error> {
        let mut seed = Box::new([0u8; 32]);
        OsRng
            .try_fill_bytes(seed.as_mut_slice())
            .map_err(|_| Error::Random)?;
        Ok(X25519Secret::from(seed))
    }

    fn agree(
        &self,
        secret: &X25519Secret,
        public_key: &X25519PublicKey,
    ) -> Result<Box<[u8; 32]>, Error> {
        let mut shared = secret.dh(public_key);
        if !shared.was_contributory() {
            shared.zeroize();
            return Err(Error::InvalidPublicKey);
        }

        let output = Box::new(shared.to_bytes());
        shared.zeroize();
        Ok(output)
    }

    fn nonce(&self) -> Result<[u8; NONCE_SIZE], Error> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.try_fill_bytes(&mut nonce).map_err(|_| Error::Random)?;
        Ok(nonce)
    }

    fn seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Crypto("Invalid message key length".to_string()))?;

        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::Crypto("Message encryption failed".to_string()))
    }

    fn open(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Crypto("Invalid message key length".to_string()))?;

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::AuthenticationFailure)
    }
}

/// Derives the initial root key from the X3DH shared secret.
pub(crate) fn derive_root_key(shared_secret: &[u8], info: &[u8]) -> Result<Box<[u8; 32]>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);

    let mut root_key = Box::new([0u8; 32]);
    hkdf.expand(info, root_key.as_mut_slice())?;

    Ok(root_key)
}

/// Root key KDF.
///
/// Expands 64 bytes of HKDF output and splits them into a new root key and a
/// new chain key. `salt` is `None` for the bootstrap derivation that runs
/// before any Diffie-Hellman agreement exists.
pub(crate) fn kdf_rk(
    salt: Option<&[u8; 32]>,
    ikm: &[u8],
    info: &[u8],
) -> Result<(Box<[u8; 32]>, Box<[u8; 32]>), Error> {
    let hkdf = Hkdf::<Sha256>::new(salt.map(|salt| salt.as_slice()), ikm);

    let mut okm = Box::new([0u8; 64]);
    hkdf.expand(info, okm.as_mut_slice())?;

    let mut root_key = Box::new([0u8; 32]);
    let mut chain_key = Box::new([0u8; 32]);
    root_key.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();

    Ok((root_key, chain_key))
}

/// HMAC-SHA256 of a single constant byte, keyed with a chain key.
pub(crate) fn hmac_step(chain_key: &[u8; 32], input: u8) -> Result<Box<[u8; 32]>, Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
        .map_err(|err| Error::KeyDerivationFailure(err.to_string()))?;
    mac.update(&[input]);

    let mut result: [u8; 32] = mac.finalize().into_bytes().into();
    let output = Box::new(result);
    result.zeroize();

    Ok(output)
}
