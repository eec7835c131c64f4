//! Authenticated payload encryption.
//!
//! The plaintext is wrapped in a 48-byte secure header (magic, original
//! size, HMAC-SHA256) and sealed with XChaCha20-Poly1305 under a key derived
//! from the password with Argon2id. Output layout:
//! `salt(16) ‖ nonce(24) ‖ ciphertext+tag`.
//!
//! Every decryption failure collapses into one opaque error so callers leak
//! nothing about which check failed.

use argon2::Argon2;
use byteorder::{BigEndian, ByteOrder};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::config::SECURE_MAGIC;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("failed to decrypt: invalid password or corrupted data")]
    Opaque,
}

pub const SECURE_HEADER_SIZE: usize = 48;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;

// Argon2id parameters: deliberately heavy, one derivation per file.
const ARGON2_TIME_COST: u32 = 6;
const ARGON2_MEM_COST: u32 = 128 * 1024; // KiB
const ARGON2_PARALLELISM: u32 = 4;
const KEY_MATERIAL_LEN: usize = 64; // 32 cipher + 32 hmac

/// Encrypted metadata prepended to the plaintext before sealing:
/// magic (4) + original size (8) + HMAC-SHA256 (32) + reserved (4).
#[derive(Debug, Clone, Copy)]
struct SecureHeader {
    magic: [u8; 4],
    original_size: u64,
    content_hmac: [u8; 32],
}

impl SecureHeader {
    fn encode(&self) -> [u8; SECURE_HEADER_SIZE] {
        let mut buf = [0u8; SECURE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        BigEndian::write_u64(&mut buf[4..12], self.original_size);
        buf[12..44].copy_from_slice(&self.content_hmac);
        buf
    }

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < SECURE_HEADER_SIZE {
            return None;
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        let mut content_hmac = [0u8; 32];
        content_hmac.copy_from_slice(&data[12..44]);
        Some(SecureHeader {
            magic,
            original_size: BigEndian::read_u64(&data[4..12]),
            content_hmac,
        })
    }
}

/// Derive 64 bytes of key material from a password and salt.
fn derive_keys(password: &str, salt: &[u8]) -> Result<[u8; KEY_MATERIAL_LEN], CryptoError> {
    let params = argon2::Params::new(
        ARGON2_MEM_COST,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(KEY_MATERIAL_LEN),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut material = [0u8; KEY_MATERIAL_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut material)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(material)
}

fn content_hmac(key: &[u8], plaintext: &[u8]) -> [u8; 32] {
    let mut mac: HmacSha256 = Mac::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(plaintext);
    mac.finalize().into_bytes().into()
}

/// Encrypt a payload, binding its size and HMAC inside the sealed header.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    let material = derive_keys(password, &salt)?;
    let (enc_key, hmac_key) = material.split_at(32);

    let header = SecureHeader {
        magic: SECURE_MAGIC,
        original_size: plaintext.len() as u64,
        content_hmac: content_hmac(hmac_key, plaintext),
    };

    let mut message = Vec::with_capacity(SECURE_HEADER_SIZE + plaintext.len());
    message.extend_from_slice(&header.encode());
    message.extend_from_slice(plaintext);

    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(enc_key));
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, message.as_slice())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload and verify its HMAC. Any failure returns the same
/// opaque error.
pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    if data.len() < SALT_SIZE + NONCE_SIZE {
        return Err(CryptoError::Opaque);
    }
    let (salt, rest) = data.split_at(SALT_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

    let material = derive_keys(password, salt).map_err(|_| CryptoError::Opaque)?;
    let (enc_key, hmac_key) = material.split_at(32);

    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(enc_key));
    let message = cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Opaque)?;

    let header = SecureHeader::decode(&message).ok_or(CryptoError::Opaque)?;
    if header.magic != SECURE_MAGIC {
        return Err(CryptoError::Opaque);
    }

    let plaintext = &message[SECURE_HEADER_SIZE..];
    if plaintext.len() as u64 != header.original_size {
        return Err(CryptoError::Opaque);
    }

    let mut mac: HmacSha256 = Mac::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(plaintext);
    if mac.verify_slice(&header.content_hmac).is_err() {
        return Err(CryptoError::Opaque);
    }

    Ok(plaintext.to_vec())
}
