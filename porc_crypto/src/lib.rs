//! Functions for the core crypto of porc relays.
//!
//! Three primitives are used:
//!
//! - long-term and session key pairs (`crypto_box`) for the secured transport
//!   and for sealing hop keys;
//! - per-hop onion layers ([`LayerKey`]) based on `xsalsa20poly1305`;
//! - sealed hop keys ([`seal_key`] / [`open_sealed_key`]) that let a client
//!   hand a fresh [`LayerKey`] to a relay knowing only its public key.

#![forbid(unsafe_code)]

mod layer;
mod sealed;

pub use self::layer::*;
pub use self::sealed::*;

use crypto_box::{SalsaBox, aead::generic_array::typenum::marker_traits::Unsigned};
use crypto_box::aead::AeadCore;
pub use crypto_box::{PublicKey, SecretKey};

pub type Nonce = [u8; <SalsaBox as AeadCore>::NonceSize::USIZE];
pub const NONCEBYTES: usize = <SalsaBox as AeadCore>::NonceSize::USIZE;

/** Increment given nonce by 1.

    Treats `Nonce` as BE number.

    If nonce can't be incremented (all bits are `1`), nonce is zeroed.
*/
#[inline]
pub fn increment_nonce(nonce: &mut Nonce) {
    increment_nonce_number(nonce, 1)
}

/// Increment given nonce by number `num`.
pub fn increment_nonce_number(nonce: &mut Nonce, num: u16) {
    let mut c = num as u32;
    for i in (0 .. NONCEBYTES).rev() {
        c += nonce[i] as u32;
        nonce[i] = c as u8;
        c >>= 8;
    }
}
