//! Relay key file: the public key followed by the secret key, raw bytes.

use std::convert::TryInto;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};

use anyhow::{bail, Context, Error};
use porc::crypto::*;
use rand::thread_rng;

const KEYS_FILE_SIZE: usize = crypto_box::KEY_SIZE * 2;

/// Save relay keys to a binary file readable by the owner only.
pub fn save_keys(keys_file: &str, pk: &PublicKey, sk: &SecretKey) -> Result<(), Error> {
    #[cfg(unix)]
    use std::os::unix::fs::OpenOptionsExt;

    #[cfg(not(unix))]
    let mut file = File::create(keys_file)
        .with_context(|| format!("Failed to create the keys file '{}'", keys_file))?;

    #[cfg(unix)]
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(keys_file)
        .with_context(|| format!("Failed to create the keys file '{}'", keys_file))?;

    file.write_all(pk.as_bytes()).context("Failed to save public key to the keys file")?;
    file.write_all(sk.as_bytes()).context("Failed to save secret key to the keys file")?;
    Ok(())
}

fn read_keys(mut file: File) -> Result<(PublicKey, SecretKey), Error> {
    let mut buf = [0; KEYS_FILE_SIZE];
    file.read_exact(&mut buf).context("Failed to read keys from the keys file")?;
    let pk_bytes: [u8; crypto_box::KEY_SIZE] = buf[..crypto_box::KEY_SIZE].try_into()
        .context("Failed to read public key from the keys file")?;
    let sk_bytes: [u8; crypto_box::KEY_SIZE] = buf[crypto_box::KEY_SIZE..].try_into()
        .context("Failed to read secret key from the keys file")?;
    let pk = PublicKey::from(pk_bytes);
    let sk = SecretKey::from(sk_bytes);
    if pk != sk.public_key() {
        bail!("The loaded public key does not correspond to the loaded secret key");
    }
    Ok((pk, sk))
}

/// Load relay keys from a binary file.
pub fn load_keys(keys_file: &str) -> Result<(PublicKey, SecretKey), Error> {
    let file = File::open(keys_file)
        .with_context(|| format!("Failed to open the keys file '{}'", keys_file))?;
    read_keys(file)
}

/// Load relay keys from a binary file or generate and save them if file does
/// not exist.
pub fn load_or_gen_keys(keys_file: &str) -> Result<(PublicKey, SecretKey), Error> {
    match File::open(keys_file) {
        Ok(file) => read_keys(file),
        Err(ref e) if e.kind() == ErrorKind::NotFound => {
            info!("Generating new relay keys and storing them to '{}'", keys_file);
            let sk = SecretKey::generate(&mut thread_rng());
            let pk = sk.public_key();
            save_keys(keys_file, &pk, &sk)?;
            Ok((pk, sk))
        },
        Err(e) => Err(Error::new(e).context(format!("Failed to read the keys file '{}'", keys_file))),
    }
}

/// Pick the relay keys: an explicit secret key, then the keys file, then a
/// fresh key pair that lives as long as the process.
pub fn relay_keys(sk: Option<&SecretKey>, keys_file: Option<&str>) -> Result<(PublicKey, SecretKey), Error> {
    if let Some(sk) = sk {
        return Ok((sk.public_key(), sk.clone()))
    }
    if let Some(keys_file) = keys_file {
        return load_or_gen_keys(keys_file)
    }
    info!("No keys file is set, generating ephemeral relay keys");
    let sk = SecretKey::generate(&mut thread_rng());
    Ok((sk.public_key(), sk))
}
