// Copyright (c) 2023 Shift Crypto AG

//! Channel cipher and key stretching
//!
//! The command channel is encrypted with AES-256-CBC under a key derived by
//! double-SHA256 of the device password. Backup/seed commands additionally
//! carry key material stretched with PBKDF2-HMAC-SHA512; that key never
//! equals the channel key.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// PBKDF2 salt fixed by the device firmware.
const STRETCH_SALT: &[u8] = b"Digital Bitbox";
const STRETCH_ITERATIONS: u32 = 20480;
const STRETCH_KEY_LEN: usize = 64;

/// Derive the symmetric channel key from the device password.
pub fn encryption_key(password: &str) -> Zeroizing<[u8; 32]> {
    let first = Sha256::digest(password.as_bytes());
    let second = Sha256::digest(first);
    Zeroizing::new(second.into())
}

/// Encrypt a serialized command. Returns base64(IV || ciphertext).
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> String {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    BASE64.encode(out)
}

/// Decrypt a base64(IV || ciphertext) reply. Failure is a hard channel
/// error; the caller must not retry.
pub fn decrypt(key: &[u8; 32], ciphertext: &str) -> Result<Vec<u8>, Error> {
    let raw = BASE64.decode(ciphertext).map_err(|_| Error::Decrypt)?;
    if raw.len() < IV_LEN || (raw.len() - IV_LEN) % 16 != 0 {
        return Err(Error::Decrypt);
    }
    let (iv, ciphertext) = raw.split_at(IV_LEN);
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| Error::Decrypt)?;

    Aes256CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decrypt)
}

fn stretch_once(password: &str) -> Zeroizing<[u8; STRETCH_KEY_LEN]> {
    let mut out = Zeroizing::new([0u8; STRETCH_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha512>(
        password.as_bytes(),
        STRETCH_SALT,
        STRETCH_ITERATIONS,
        out.as_mut(),
    );
    out
}

/// Stretch a password into hex-encoded backup key material.
///
/// Computed twice and compared; a mismatch indicates a memory fault and is
/// reported rather than silently sending corrupt key material to the device.
pub fn stretch_key(password: &str) -> Result<Zeroizing<String>, Error> {
    let first = stretch_once(password);
    let second = stretch_once(password);
    if *first != *second {
        return Err(Error::KeyStretch);
    }
    Ok(Zeroizing::new(hex::encode(*first)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_double_sha256() {
        // echo -n "test" | sha256 | sha256
        let key = encryption_key("test");
        assert_eq!(
            hex::encode(*key),
            "954d5a49fd70d9b8bcdb35d252267829957f7ef7fa6c74f88419bdc5e82209f4"
        );
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = encryption_key("secret");
        for msg in [&b""[..], b"x", b"{\"ping\": \"\"}", &[0u8; 1000]] {
            let ciphertext = encrypt(&key, msg);
            assert_eq!(decrypt(&key, &ciphertext).unwrap(), msg);
        }
    }

    #[test]
    fn ciphertexts_are_randomized() {
        let key = encryption_key("secret");
        let a = encrypt(&key, b"same message");
        let b = encrypt(&key, b"same message");
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let ciphertext = encrypt(&encryption_key("right"), b"payload");
        assert!(matches!(
            decrypt(&encryption_key("wrong"), &ciphertext),
            Err(Error::Decrypt)
        ));
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let key = encryption_key("secret");
        assert!(matches!(decrypt(&key, "not base64 !!"), Err(Error::Decrypt)));
        assert!(matches!(decrypt(&key, "AAAA"), Err(Error::Decrypt)));
    }

    #[test]
    fn stretched_key_is_hex_of_64_bytes() {
        let stretched = stretch_key("pw").unwrap();
        assert_eq!(stretched.len(), 128);
        assert!(stretched.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic for a fixed password.
        assert_eq!(*stretched, *stretch_key("pw").unwrap());
        assert_ne!(*stretched, *stretch_key("pw2").unwrap());
    }
}
