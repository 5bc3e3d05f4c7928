//! Stateless authenticated packet encryption.
//!
//! Uses ChaCha20-Poly1305 with a fresh random nonce per packet. The nonce is
//! carried in the packet itself, so decryption of any packet depends only on
//! the ciphertext and the key, never on prior packets. This property is
//! required by the UDP underlay, where packets may be lost or reordered.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecureRandom, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// A stateless block cipher bound to one pre-shared key.
///
/// `encrypt` emits `nonce || ciphertext || tag`; `decrypt` parses the same
/// layout. Cloning yields an independent instance that is safe to hand to
/// another task.
pub struct BlockCipher {
    cipher: ChaCha20Poly1305,
    key: AeadKey,
}

impl BlockCipher {
    /// Create a new cipher from a derived key.
    pub fn new(key: AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            key,
        }
    }

    /// Whether decryption depends only on the packet itself.
    ///
    /// Always true for this construction: the nonce travels with the packet
    /// and no counter state is shared between packets. The UDP underlay
    /// refuses ciphers where this does not hold.
    pub fn is_stateless(&self) -> bool {
        true
    }

    /// Encrypt a plaintext block.
    ///
    /// Returns `nonce || ciphertext || tag` with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce: [u8; NONCE_SIZE] = SecureRandom::bytes();
        let ciphertext = self
            .cipher
            .encrypt((&nonce).into(), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext || tag` block.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is too short or authentication fails
    /// (wrong key, tampered data).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Buffer {
                expected: NONCE_SIZE + TAG_SIZE,
                actual: data.len(),
            });
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[..NONCE_SIZE]);
        self.cipher
            .decrypt((&nonce).into(), &data[NONCE_SIZE..])
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }

    /// Encrypt under an explicit nonce, returning `ciphertext || tag` only.
    ///
    /// Used where one datagram carries several blocks: the nonce travels
    /// once, and each further block uses a distinct derived nonce (see
    /// [`advance_nonce`]). Never call twice with the same nonce.
    pub fn seal_with(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(nonce.into(), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt a `ciphertext || tag` block under an explicit nonce.
    pub fn open_with(&self, nonce: &[u8; NONCE_SIZE], data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: data.len(),
            });
        }
        self.cipher
            .decrypt(nonce.into(), data)
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}

/// Derive the next nonce in a datagram-local sequence.
///
/// Increments the trailing eight bytes as a little-endian counter, keeping
/// the leading bytes as random context. Blocks within one datagram get
/// distinct nonces without spending wire bytes on each.
pub fn advance_nonce(nonce: &[u8; NONCE_SIZE]) -> [u8; NONCE_SIZE] {
    let mut next = *nonce;
    let tail = NONCE_SIZE - 8;
    let counter = u64::from_le_bytes(next[tail..].try_into().expect("8-byte slice"));
    next[tail..].copy_from_slice(&counter.wrapping_add(1).to_le_bytes());
    next
}

impl Clone for BlockCipher {
    fn clone(&self) -> Self {
        Self::new(self.key.clone())
    }
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher").finish_non_exhaustive()
    }
}

/// Try each candidate cipher until one authenticates the block.
///
/// Returns the index of the matching candidate and the decrypted plaintext.
/// Candidates are cloned before use, so the caller's list stays usable.
pub fn select_decrypt(data: &[u8], candidates: &[BlockCipher]) -> Result<(usize, Vec<u8>)> {
    for (i, candidate) in candidates.iter().enumerate() {
        if let Ok(plaintext) = candidate.clone().decrypt(data) {
            return Ok((i, plaintext));
        }
    }
    Err(Error::crypto("no candidate cipher authenticated the block"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;

    fn test_cipher(name: &str) -> BlockCipher {
        BlockCipher::new(derive_key(name, "test-password"))
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = test_cipher("alice");
        let plaintext = b"Hello, World!";

        let wire = cipher.encrypt(plaintext).unwrap();
        assert_eq!(wire.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let decrypted = cipher.decrypt(&wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_packet() {
        let cipher = test_cipher("alice");
        let a = cipher.encrypt(b"same input").unwrap();
        let b = cipher.encrypt(b"same input").unwrap();

        // Same plaintext must never produce the same bytes on the wire
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = test_cipher("alice");
        let bob = test_cipher("bob");

        let wire = alice.encrypt(b"secret data").unwrap();
        assert!(bob.decrypt(&wire).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = test_cipher("alice");
        let mut wire = cipher.encrypt(b"secret data").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        assert!(cipher.decrypt(&wire).is_err());
    }

    #[test]
    fn test_too_short_block() {
        let cipher = test_cipher("alice");
        let result = cipher.decrypt(&[0u8; NONCE_SIZE + TAG_SIZE - 1]);
        assert!(matches!(result, Err(Error::Buffer { .. })));
    }

    #[test]
    fn test_clone_is_independent() {
        let cipher = test_cipher("alice");
        let clone = cipher.clone();

        let wire = cipher.encrypt(b"payload").unwrap();
        assert_eq!(clone.decrypt(&wire).unwrap(), b"payload");
    }

    #[test]
    fn test_select_decrypt_finds_the_encryptor() {
        let candidates: Vec<BlockCipher> =
            ["u0", "u1", "u2", "u3"].iter().map(|u| test_cipher(u)).collect();

        for k in 0..candidates.len() {
            let wire = candidates[k].encrypt(b"who am I").unwrap();
            let (found, plaintext) = select_decrypt(&wire, &candidates).unwrap();
            assert_eq!(found, k);
            assert_eq!(plaintext, b"who am I");
        }
    }

    #[test]
    fn test_seal_open_with_explicit_nonce() {
        let cipher = test_cipher("alice");
        let nonce = crate::crypto::SecureRandom::bytes();

        let block = cipher.seal_with(&nonce, b"second block").unwrap();
        assert_eq!(block.len(), b"second block".len() + TAG_SIZE);

        assert_eq!(cipher.open_with(&nonce, &block).unwrap(), b"second block");

        // A different nonce must not authenticate
        let other = advance_nonce(&nonce);
        assert!(cipher.open_with(&other, &block).is_err());
    }

    #[test]
    fn test_advance_nonce_changes_and_is_deterministic() {
        let nonce = [7u8; NONCE_SIZE];
        let next = advance_nonce(&nonce);
        assert_ne!(nonce, next);
        assert_eq!(next, advance_nonce(&nonce));
        // Leading context bytes survive
        assert_eq!(nonce[..NONCE_SIZE - 8], next[..NONCE_SIZE - 8]);
    }

    #[test]
    fn test_select_decrypt_no_match() {
        let candidates = vec![test_cipher("u0"), test_cipher("u1")];
        let outsider = test_cipher("mallory");

        let wire = outsider.encrypt(b"not yours").unwrap();
        assert!(select_decrypt(&wire, &candidates).is_err());
    }
}
