/*! Establish a secure [`Channel`](./struct.Channel.html) between two peers
using temporary [`Session`](./struct.Session.html)s.

```
use porc_core::relay::secure::*;

let alice_session = Session::random();
let bob_session = Session::random();

// assume we got Alice's PK & Nonce via handshake
let alice_pk = alice_session.pk().clone();
let alice_nonce = *alice_session.nonce();

// assume we got Bob's PK & Nonce via handshake
let bob_pk = bob_session.pk().clone();
let bob_nonce = *bob_session.nonce();

// Now both Alice and Bob may create secure Channels
let mut alice_channel = Channel::new(&alice_session, &bob_pk, &bob_nonce);
let mut bob_channel = Channel::new(&bob_session, &alice_pk, &alice_nonce);

let encrypted = alice_channel.encrypt(b"Hello Bob!").unwrap();
assert_eq!(bob_channel.decrypt(&encrypted).unwrap(), b"Hello Bob!".to_vec());
```

*/

use std::sync::Arc;

use crypto_box::{SalsaBox, aead::{Aead, AeadCore, Error as AeadError}};
use rand::thread_rng;

use porc_crypto::*;

/** A Session is created on both sides.
Its PK and Nonce are sent to the other side via handshake. Both sides then
create a [`Channel`](./struct.Channel.html) from their own `Session` and the
PK and Nonce of the other side.
*/
pub struct Session {
    /// pk must be sent to another peer
    pk: PublicKey,
    /// sk is used with `other_pk` to create a precomputed key
    sk: SecretKey,
    /// nonce must be sent to another peer
    nonce: Nonce,
}

impl Session {
    /// Create a new `Session` with random pk, sk and nonce.
    pub fn random() -> Session {
        let mut rng = thread_rng();
        let sk = SecretKey::generate(&mut rng);
        let pk = sk.public_key();
        let nonce = SalsaBox::generate_nonce(&mut rng).into();
        Session { pk, sk, nonce }
    }

    /// Get the PK of the Session
    pub fn pk(&self) -> &PublicKey {
        &self.pk
    }

    /// Get the Nonce of the Session
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Create the precomputed key to encrypt/decrypt data with `other_pk`.
    pub fn create_precomputed_key(&self, other_pk: &PublicKey) -> SalsaBox {
        SalsaBox::new(other_pk, &self.sk)
    }
}

/** Encrypts records with the precomputed key.
Increments `sent_nonce` after data was encrypted and `recv_nonce` after data
was decrypted.

A clone shares the key and continues both nonces, so a connection split into
read and write halves keeps one clone per half.
*/
#[derive(Clone)]
pub struct Channel {
    precomputed_key: Arc<SalsaBox>,
    sent_nonce: Nonce,
    recv_nonce: Nonce,
}

impl Channel {
    /// Create a secure channel with `our_session` and `their_pk` & `their_nonce`
    pub fn new(our_session: &Session, their_pk: &PublicKey, their_nonce: &Nonce) -> Channel {
        Channel {
            precomputed_key: Arc::new(our_session.create_precomputed_key(their_pk)),
            sent_nonce: *our_session.nonce(),
            recv_nonce: *their_nonce,
        }
    }

    /// Encrypt data, increment sent_nonce
    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, AeadError> {
        let encrypted = self.precomputed_key.encrypt((&self.sent_nonce).into(), plain);
        increment_nonce(&mut self.sent_nonce);
        encrypted
    }

    /// Decrypt data, increment recv_nonce
    pub fn decrypt(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, AeadError> {
        let decrypted = self.precomputed_key.decrypt((&self.recv_nonce).into(), encrypted);
        increment_nonce(&mut self.recv_nonce);
        decrypted
    }
}
