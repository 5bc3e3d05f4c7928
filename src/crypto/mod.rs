//! Cryptographic primitives for shroud.
//!
//! This module provides:
//! - Stateless ChaCha20-Poly1305 packet encryption with per-packet nonces
//! - Trial decryption against a candidate cipher set
//! - HKDF key derivation from pre-shared user credentials
//! - Secure random number generation and padding
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod kdf;
mod random;

pub use aead::{advance_nonce, select_decrypt, AeadKey, BlockCipher};
pub use kdf::derive_key;
pub use random::{new_padding, padding_len, SecureRandom};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_and_encrypt_roundtrip() {
        // Two peers derive the same cipher from shared credentials
        let key1 = derive_key("alice", "correct horse battery staple");
        let key2 = derive_key("alice", "correct horse battery staple");
        assert_eq!(key1.as_bytes(), key2.as_bytes());

        let sender = BlockCipher::new(key1);
        let receiver = BlockCipher::new(key2);

        let plaintext = b"multiplexed session traffic";
        let wire = sender.encrypt(plaintext).unwrap();
        assert_eq!(wire.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let decrypted = receiver.decrypt(&wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_different_users_different_keys() {
        let alice = derive_key("alice", "hunter2");
        let bob = derive_key("bob", "hunter2");
        assert_ne!(alice.as_bytes(), bob.as_bytes());
    }
}
