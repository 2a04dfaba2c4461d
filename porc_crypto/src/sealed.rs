/*! Sealed hop keys.

A client creates a fresh [`LayerKey`] for every hop and seals it to the
relay's long-term public key with an ephemeral key pair, so only the holder
of the relay's secret key can open it.

Serialized form:

Length | Content
------ | ------
`32`   | Ephemeral public key
`24`   | Nonce
`48`   | Encrypted [`LayerKey`] plus MAC

*/

use std::convert::TryInto;

use crypto_box::{PublicKey, SalsaBox, SecretKey, KEY_SIZE};
use crypto_box::aead::{Aead, AeadCore};
use rand::thread_rng;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{LayerKey, LAYER_KEY_SIZE, NONCEBYTES};

/// Size of a [`SealedKey`].
pub const SEALED_KEY_SIZE: usize = KEY_SIZE + NONCEBYTES + LAYER_KEY_SIZE + xsalsa20poly1305::TAG_SIZE;

/// A [`LayerKey`] encrypted to a relay's public key.
pub type SealedKey = [u8; SEALED_KEY_SIZE];

/// Error that can happen when sealing a key.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SealKeyError {
    /// Encryption of the key failed.
    #[error("Failed to encrypt the layer key")]
    Encrypt,
}

/// Error that can happen when opening a sealed key.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum OpenSealedKeyError {
    /// Decryption failed, the key was sealed for another relay or corrupted.
    #[error("Failed to decrypt the sealed key")]
    Decrypt,
    /// Decrypted data has unexpected length.
    #[error("Decrypted key has invalid length: {len}")]
    InvalidLength {
        /// Length of the decrypted data.
        len: usize,
    },
}

/// Seal `key` so that only the owner of `relay_pk` can open it.
pub fn seal_key(relay_pk: &PublicKey, key: &LayerKey) -> Result<SealedKey, SealKeyError> {
    let mut rng = thread_rng();
    let ephemeral_sk = SecretKey::generate(&mut rng);
    let ephemeral_pk = ephemeral_sk.public_key();

    let salsa = SalsaBox::new(relay_pk, &ephemeral_sk);
    let nonce = SalsaBox::generate_nonce(&mut rng);
    let encrypted = salsa.encrypt(&nonce, &key.as_bytes()[..])
        .map_err(|_| SealKeyError::Encrypt)?;

    let mut sealed = [0; SEALED_KEY_SIZE];
    sealed[..KEY_SIZE].copy_from_slice(ephemeral_pk.as_bytes());
    sealed[KEY_SIZE..KEY_SIZE + NONCEBYTES].copy_from_slice(&nonce);
    sealed[KEY_SIZE + NONCEBYTES..].copy_from_slice(&encrypted);
    Ok(sealed)
}

/// Open a key sealed with [`seal_key`] using the relay's secret key.
pub fn open_sealed_key(relay_sk: &SecretKey, sealed: &SealedKey) -> Result<LayerKey, OpenSealedKeyError> {
    let (ephemeral_pk, rest) = sealed.split_at(KEY_SIZE);
    let (nonce, encrypted) = rest.split_at(NONCEBYTES);

    let ephemeral_pk: [u8; KEY_SIZE] = ephemeral_pk.try_into()
        .map_err(|_| OpenSealedKeyError::Decrypt)?;
    let salsa = SalsaBox::new(&PublicKey::from(ephemeral_pk), relay_sk);
    let decrypted = Zeroizing::new(
        salsa.decrypt(nonce.into(), encrypted)
            .map_err(|_| OpenSealedKeyError::Decrypt)?
    );

    let key: [u8; LAYER_KEY_SIZE] = decrypted.as_slice().try_into()
        .map_err(|_| OpenSealedKeyError::InvalidLength { len: decrypted.len() })?;
    Ok(LayerKey::from(key))
}
