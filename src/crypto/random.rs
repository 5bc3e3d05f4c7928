//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes using the operating
//! system's entropy source.

use rand::{CryptoRng, RngCore};
use rand_core::OsRng;

/// Maximum padding length, exclusive. Lengths are uniform in `[0, 255)`.
pub const MAX_PADDING: usize = 255;

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix,
/// BCryptGenRandom on Windows).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u64.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }

    /// Generate a random u32.
    pub fn u32() -> u32 {
        OsRng.next_u32()
    }

    /// Get an RNG instance that implements CryptoRng.
    pub fn rng() -> impl RngCore + CryptoRng {
        OsRng
    }
}

/// Draw a padding length, uniform in `[0, MAX_PADDING)`.
pub fn padding_len() -> u8 {
    (SecureRandom::u32() % MAX_PADDING as u32) as u8
}

/// Generate random padding of the specified length.
///
/// Padding bytes are drawn from the OS RNG so padding is indistinguishable
/// from ciphertext.
pub fn new_padding(len: usize) -> Vec<u8> {
    let mut padding = vec![0u8; len];
    SecureRandom::fill(&mut padding);
    padding
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_secure_random_fill() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];

        SecureRandom::fill(&mut buf1);
        SecureRandom::fill(&mut buf2);

        // Should not produce all zeros
        assert!(!buf1.iter().all(|&b| b == 0));
        assert!(!buf2.iter().all(|&b| b == 0));

        // Should produce different values each time
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_new_padding() {
        let padding = new_padding(100);
        assert_eq!(padding.len(), 100);

        // All zeros is astronomically unlikely with real randomness
        assert!(!padding.iter().all(|&b| b == 0));

        assert!(new_padding(0).is_empty());
    }

    #[test]
    fn test_padding_len_range() {
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let len = padding_len();
            assert!((len as usize) < MAX_PADDING);
            seen.insert(len);
        }

        // Uniform draws over [0, 255) should show plenty of variety
        assert!(seen.len() > 50);
    }
}
