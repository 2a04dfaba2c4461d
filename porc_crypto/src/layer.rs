/*! Onion layers.

Every hop of a circuit owns one symmetric [`LayerKey`]. Traveling downstream
each hop removes exactly one layer, traveling upstream each hop adds one.

Serialized form of a layer:

Length     | Content
---------- | ------
`24`       | Random nonce
variable   | Encrypted inner payload plus `16` bytes MAC

*/

use std::fmt;
use std::ops::Deref;

use rand::{thread_rng, Rng};
use thiserror::Error;
use xsalsa20poly1305::aead::{Aead, AeadCore};
use xsalsa20poly1305::{KeyInit, XSalsa20Poly1305};
use zeroize::Zeroizing;

/// Size of a serialized [`LayerKey`].
pub const LAYER_KEY_SIZE: usize = xsalsa20poly1305::KEY_SIZE;

/// Amount of bytes one onion layer adds to its payload.
pub const LAYER_OVERHEAD: usize = xsalsa20poly1305::NONCE_SIZE + xsalsa20poly1305::TAG_SIZE;

/// Error that can happen when adding or removing an onion layer.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum LayerError {
    /// Layered payload is shorter than a nonce plus MAC.
    #[error("Layered payload is too short: {len} bytes")]
    TooShort {
        /// Length of the rejected payload.
        len: usize,
    },
    /// Payload can't be encrypted.
    #[error("Failed to encrypt onion layer")]
    Encrypt,
    /// MAC check failed, the layer was created with another key or corrupted.
    #[error("Failed to decrypt onion layer")]
    Decrypt,
}

/// Symmetric key of one hop. Zeroed on drop.
#[derive(Clone)]
pub struct LayerKey {
    key: Zeroizing<[u8; LAYER_KEY_SIZE]>,
}

impl LayerKey {
    /// Generate a new random key.
    pub fn generate() -> LayerKey {
        let mut key = Zeroizing::new([0; LAYER_KEY_SIZE]);
        thread_rng().fill(&mut key[..]);
        LayerKey { key }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; LAYER_KEY_SIZE] {
        &self.key
    }

    fn cipher(&self) -> XSalsa20Poly1305 {
        XSalsa20Poly1305::new(self.key.deref().into())
    }

    /// Encrypt `payload` adding one layer.
    pub fn add_layer(&self, payload: &[u8]) -> Result<Vec<u8>, LayerError> {
        let nonce = XSalsa20Poly1305::generate_nonce(&mut thread_rng());
        let encrypted = self.cipher().encrypt(&nonce, payload)
            .map_err(|_| LayerError::Encrypt)?;

        let mut output = Vec::with_capacity(LAYER_OVERHEAD + payload.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&encrypted);
        Ok(output)
    }

    /// Decrypt `layered` removing one layer.
    pub fn remove_layer(&self, layered: &[u8]) -> Result<Vec<u8>, LayerError> {
        if layered.len() < LAYER_OVERHEAD {
            return Err(LayerError::TooShort { len: layered.len() });
        }

        let (nonce, encrypted) = layered.split_at(xsalsa20poly1305::NONCE_SIZE);
        self.cipher().decrypt(nonce.into(), encrypted)
            .map_err(|_| LayerError::Decrypt)
    }
}

impl From<[u8; LAYER_KEY_SIZE]> for LayerKey {
    fn from(bytes: [u8; LAYER_KEY_SIZE]) -> Self {
        LayerKey { key: Zeroizing::new(bytes) }
    }
}

impl PartialEq for LayerKey {
    fn eq(&self, other: &Self) -> bool {
        self.key[..] == other.key[..]
    }
}

impl Eq for LayerKey {}

impl fmt::Debug for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("LayerKey(..)")
    }
}
