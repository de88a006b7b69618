//! Deterministic keystream used to poison and verify quarantined memory.
//!
//! The generator is a multiplicative congruence over a fixed modulus.
//! Fill and verify both restart from the same seed, so a quarantined
//! region reads back exactly the stream it was filled with unless
//! something else wrote into it in between.

/// Initial generator state.
pub const KEYSTREAM_SEED: u32 = 0x155c_96f9;

/// Per-step multiplier.
pub const KEYSTREAM_FACTOR: u32 = 0xaa39_456b;

/// Modulus; the state never reaches it.
pub const KEYSTREAM_MODULUS: u32 = 0xf4ae_ac59;

/// Infinite 32-bit word sequence, restartable from the fixed seed.
#[derive(Debug, Clone)]
pub struct Keystream {
    state: u32,
}

impl Keystream {
    pub fn new() -> Self {
        Self {
            state: KEYSTREAM_SEED,
        }
    }
}

impl Default for Keystream {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Keystream {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let word = self.state;
        self.state = ((u64::from(self.state) * u64::from(KEYSTREAM_FACTOR))
            % u64::from(KEYSTREAM_MODULUS)) as u32;
        Some(word)
    }
}

/// Where a verified buffer first stopped matching the keystream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    /// Bytes that still matched before the first wrong word.
    pub valid_bytes: usize,
    /// Consecutive words (first one included) equal to `value`.
    pub run_words: usize,
    /// The wrong word found at the divergence point.
    pub value: u32,
}

/// Overwrite `buf` with the keystream, word by word in native order.
///
/// Trailing bytes past the last full word are left untouched; nothing
/// ever hands out buffers that small, and a partial word is not worth
/// a byte-wise tail.
pub fn poison_fill(buf: &mut [u8]) {
    let mut stream = Keystream::new();
    for chunk in buf.chunks_exact_mut(4) {
        // chunks_exact_mut(4) always yields 4-byte chunks
        let word = stream.next().unwrap_or_default();
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
}

/// Compare `buf` against a fresh keystream.
///
/// On the first mismatch, scans forward while the contents stay equal
/// to the first wrong value so the caller can report the corrupt run.
pub fn verify(buf: &[u8]) -> Result<(), Divergence> {
    let mut stream = Keystream::new();
    let mut words = buf.chunks_exact(4).map(|chunk| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(chunk);
        u32::from_ne_bytes(raw)
    });

    let mut index = 0usize;
    let (first_bad, value) = loop {
        match words.next() {
            None => return Ok(()),
            Some(found) => {
                let expected = stream.next().unwrap_or_default();
                if found != expected {
                    break (index, found);
                }
                index += 1;
            }
        }
    };

    let mut run_words = 1usize;
    for found in words {
        if found != value {
            break;
        }
        run_words += 1;
    }

    Err(Divergence {
        valid_bytes: first_bad * 4,
        run_words,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystream_is_restartable() {
        let first: Vec<u32> = Keystream::new().take(64).collect();
        let second: Vec<u32> = Keystream::new().take(64).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], KEYSTREAM_SEED);
    }

    #[test]
    fn keystream_stays_below_modulus() {
        for word in Keystream::new().take(10_000) {
            assert!(word < KEYSTREAM_MODULUS);
        }
    }

    #[test]
    fn fill_then_verify_round_trips() {
        let mut buf = vec![0u8; 4096];
        poison_fill(&mut buf);
        assert_eq!(verify(&buf), Ok(()));
    }

    #[test]
    fn verify_reports_first_divergence() {
        let mut buf = vec![0u8; 1024];
        poison_fill(&mut buf);

        // Stomp three consecutive words starting at word 17.
        for word in 17..20 {
            buf[word * 4..word * 4 + 4].copy_from_slice(&0xdead_beefu32.to_ne_bytes());
        }

        let div = verify(&buf).unwrap_err();
        assert_eq!(div.valid_bytes, 17 * 4);
        assert_eq!(div.run_words, 3);
        assert_eq!(div.value, 0xdead_beef);
    }

    #[test]
    fn verify_single_word_corruption_anywhere() {
        for word in [0usize, 1, 31, 63] {
            let mut buf = vec![0u8; 256];
            poison_fill(&mut buf);
            // Flip one bit so the value is guaranteed to differ.
            buf[word * 4] ^= 0x01;

            let div = verify(&buf).unwrap_err();
            assert_eq!(div.valid_bytes, word * 4, "corrupt word {word}");
            assert_eq!(div.run_words, 1);
        }
    }

    #[test]
    fn trailing_partial_word_is_ignored() {
        let mut buf = vec![0u8; 103];
        poison_fill(&mut buf);
        // The last 3 bytes were never written and never checked.
        assert_eq!(&buf[100..], &[0, 0, 0]);
        assert_eq!(verify(&buf), Ok(()));
    }
}
