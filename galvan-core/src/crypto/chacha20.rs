//! ChaCha20 stream cipher.
//!
//! The 64-bit-nonce variant: words 12–13 hold the block counter and
//! words 14–15 the IV, so a single keystream can run for 2^64 blocks.
//! Output is byte-granular; a partial final block is generated into a
//! scratch buffer and truncated.

/// "expand 32-byte k" as four little-endian words.
const CONSTANTS: [u32; 4] = [0x61707865, 0x3320646e, 0x79622d32, 0x6b206574];

const BLOCK_SIZE: usize = 64;

#[inline]
fn quarter_round(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(16);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(12);
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(8);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(7);
}

/// ChaCha20 keystream generator and XOR cipher.
#[derive(Debug, Clone)]
pub struct ChaCha20 {
    /// The 16-word input state: constants, key, counter, IV.
    input: [u32; 16],
}

impl ChaCha20 {
    /// Construct with an all-zero key, counter and IV.
    pub fn new() -> Self {
        let mut input = [0u32; 16];
        input[..4].copy_from_slice(&CONSTANTS);
        Self { input }
    }

    /// Construct from a 256-bit key.
    pub fn with_key(key: &[u8; 32]) -> Self {
        let mut cipher = Self::new();
        cipher.set_key(key);
        cipher
    }

    /// Load a 256-bit key and reset counter and IV to zero.
    pub fn set_key(&mut self, key: &[u8; 32]) {
        for (i, chunk) in key.chunks_exact(4).enumerate() {
            self.input[4 + i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        self.input[12] = 0;
        self.input[13] = 0;
        self.input[14] = 0;
        self.input[15] = 0;
    }

    /// Set the 64-bit IV (words 14–15).
    pub fn set_iv(&mut self, iv: u64) {
        self.input[14] = iv as u32;
        self.input[15] = (iv >> 32) as u32;
    }

    /// Position the 64-bit block counter (words 12–13).
    pub fn seek(&mut self, block: u64) {
        self.input[12] = block as u32;
        self.input[13] = (block >> 32) as u32;
    }

    /// Run the block function once and advance the counter.
    fn block(&mut self, out: &mut [u8; BLOCK_SIZE]) {
        let mut state = self.input;
        for _ in 0..10 {
            quarter_round(&mut state, 0, 4, 8, 12);
            quarter_round(&mut state, 1, 5, 9, 13);
            quarter_round(&mut state, 2, 6, 10, 14);
            quarter_round(&mut state, 3, 7, 11, 15);
            quarter_round(&mut state, 0, 5, 10, 15);
            quarter_round(&mut state, 1, 6, 11, 12);
            quarter_round(&mut state, 2, 7, 8, 13);
            quarter_round(&mut state, 3, 4, 9, 14);
        }
        for (i, word) in state.iter_mut().enumerate() {
            *word = word.wrapping_add(self.input[i]);
            out[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
        }
        self.input[12] = self.input[12].wrapping_add(1);
        if self.input[12] == 0 {
            self.input[13] = self.input[13].wrapping_add(1);
        }
    }

    /// Fill `out` with keystream bytes.
    pub fn keystream(&mut self, out: &mut [u8]) {
        let mut buffer = [0u8; BLOCK_SIZE];
        let mut chunks = out.chunks_exact_mut(BLOCK_SIZE);
        for chunk in &mut chunks {
            self.block(&mut buffer);
            chunk.copy_from_slice(&buffer);
        }
        let tail = chunks.into_remainder();
        if !tail.is_empty() {
            self.block(&mut buffer);
            tail.copy_from_slice(&buffer[..tail.len()]);
        }
    }

    /// XOR `input` with keystream into `out`. The slices must have
    /// equal length; encryption and decryption are the same operation.
    pub fn crypt(&mut self, input: &[u8], out: &mut [u8]) {
        debug_assert_eq!(input.len(), out.len());
        let mut buffer = [0u8; BLOCK_SIZE];
        let mut offset = 0;
        while offset < input.len() {
            let take = BLOCK_SIZE.min(input.len() - offset);
            self.block(&mut buffer);
            for i in 0..take {
                out[offset + i] = input[offset + i] ^ buffer[i];
            }
            offset += take;
        }
    }
}

impl Default for ChaCha20 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystream_hex(cipher: &mut ChaCha20, len: usize) -> String {
        let mut out = vec![0u8; len];
        cipher.keystream(&mut out);
        hex::encode(out)
    }

    #[test]
    fn test_zero_key_zero_iv_vector() {
        // First keystream block for the all-zero key and IV.
        let mut cipher = ChaCha20::with_key(&[0u8; 32]);
        assert_eq!(
            keystream_hex(&mut cipher, 64),
            "76b8e0ada0f13d90405d6ae55386bd28bdd219b8a08ded1aa836efcc8b770dc7\
             da41597c5157488d7724e03fb8d84a376a43b8f41518a11cc387b669b2ee6586"
        );
    }

    #[test]
    fn test_key_with_one_bit_vector() {
        // Key 00..01 (last byte set), zero IV.
        let mut key = [0u8; 32];
        key[31] = 1;
        let mut cipher = ChaCha20::with_key(&key);
        assert_eq!(
            keystream_hex(&mut cipher, 64),
            "4540f05a9f1fb296d7736e7b208e3c96eb4fe1834688d2604f450952ed432d41\
             bbe2a0b6ea7566d2a5d1e7e20d42af2c53d792b1c43fea817e9ad275ae546963"
        );
    }

    #[test]
    fn test_iv_vector() {
        // Zero key, IV = 1 (big-endian byte order 00..01 as u64 1).
        let mut cipher = ChaCha20::with_key(&[0u8; 32]);
        cipher.set_iv(1);
        assert_eq!(
            keystream_hex(&mut cipher, 64),
            "de9cba7bf3d69ef5e786dc63973f653a0b49e015adbff7134fcb7df137821031\
             e85a050278a7084527214f73efc7fa5b5277062eb7a0433e445f41e31afab757"
        );
    }

    #[test]
    fn test_seek_matches_streaming() {
        let mut key = [0u8; 32];
        key[0] = 0xaa;
        let mut reference = ChaCha20::with_key(&key);
        reference.set_iv(7);
        let mut stream = vec![0u8; 256];
        reference.keystream(&mut stream);

        let mut seeked = ChaCha20::with_key(&key);
        seeked.set_iv(7);
        seeked.seek(2);
        let mut out = vec![0u8; 128];
        seeked.keystream(&mut out);
        assert_eq!(out, &stream[128..]);
    }

    #[test]
    fn test_crypt_zeros_equals_keystream() {
        let key = [3u8; 32];
        let mut a = ChaCha20::with_key(&key);
        let mut b = ChaCha20::with_key(&key);

        let mut ks = vec![0u8; 100];
        a.keystream(&mut ks);

        let zeros = vec![0u8; 100];
        let mut out = vec![0u8; 100];
        b.crypt(&zeros, &mut out);
        assert_eq!(out, ks);
    }

    #[test]
    fn test_crypt_roundtrip() {
        let key = [9u8; 32];
        let plaintext: Vec<u8> = (0..130).map(|i| i as u8).collect();

        let mut enc = ChaCha20::with_key(&key);
        enc.set_iv(42);
        let mut ciphertext = vec![0u8; plaintext.len()];
        enc.crypt(&plaintext, &mut ciphertext);
        assert_ne!(ciphertext, plaintext);

        let mut dec = ChaCha20::with_key(&key);
        dec.set_iv(42);
        let mut recovered = vec![0u8; plaintext.len()];
        dec.crypt(&ciphertext, &mut recovered);
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_partial_blocks_advance_counter_per_block() {
        // Two 32-byte reads consume two whole blocks, matching the
        // original's per-call buffered partial block behavior.
        let mut partial = ChaCha20::with_key(&[5u8; 32]);
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        partial.keystream(&mut first);
        partial.keystream(&mut second);

        let mut whole = ChaCha20::with_key(&[5u8; 32]);
        let mut both = [0u8; 128];
        whole.keystream(&mut both);

        assert_eq!(first, both[..32]);
        assert_eq!(second, both[64..96]);
    }
}
