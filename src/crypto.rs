//! Crypto Guard
//!
//! AES-128 in CFB-128 mode, driven byte by byte so the log can be
//! encrypted in arbitrary-length appends.
//!
//! ## Keystream position
//! CFB feeds ciphertext back into the shift register, so the keystream at
//! offset N depends on every ciphertext byte before N. The full state is
//! small (register + current keystream block + position) and `Copy`, so
//! the engine snapshots it at the start of each value and decrypts values
//! on read without replaying from offset 0.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

pub const AES_KEY_LEN: usize = 16;
pub const AES_BLOCK_LEN: usize = 16;

/// Initialization vector persisted in the meta record
pub type Iv = [u8; AES_BLOCK_LEN];

/// Resumable cipher position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherState {
    register: [u8; AES_BLOCK_LEN],
    keystream: [u8; AES_BLOCK_LEN],
    pos: u8,
}

impl CipherState {
    fn at_iv(iv: &Iv) -> Self {
        Self {
            register: *iv,
            keystream: [0u8; AES_BLOCK_LEN],
            pos: 0,
        }
    }
}

/// Stream cipher wrapping log reads and writes
#[derive(Clone)]
pub struct CryptoGuard {
    cipher: Aes128,
    iv: Iv,
    state: CipherState,
}

impl CryptoGuard {
    /// Derive the AES key from a passphrase
    pub fn derive_key(passphrase: &str) -> [u8; AES_KEY_LEN] {
        md5::compute(passphrase.as_bytes()).0
    }

    /// Fresh random IV for a newly created store
    pub fn generate_iv() -> Iv {
        rand::random()
    }

    /// Short fingerprint of (passphrase, iv) kept in the meta record so a
    /// wrong passphrase is caught before replay
    pub fn key_check(passphrase: &str, iv: &Iv) -> u32 {
        let mut material = Vec::with_capacity(passphrase.len() + AES_BLOCK_LEN);
        material.extend_from_slice(passphrase.as_bytes());
        material.extend_from_slice(iv);
        let digest = md5::compute(&material).0;
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    pub fn new(passphrase: &str, iv: Iv) -> Self {
        Self::with_raw_key(&Self::derive_key(passphrase), iv)
    }

    pub fn with_raw_key(key: &[u8; AES_KEY_LEN], iv: Iv) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            iv,
            state: CipherState::at_iv(&iv),
        }
    }

    pub fn iv(&self) -> &Iv {
        &self.iv
    }

    /// Return to offset 0
    pub fn reset(&mut self) {
        self.state = CipherState::at_iv(&self.iv);
    }

    /// Current position, for later `decrypt_at`
    pub fn snapshot(&self) -> CipherState {
        self.state
    }

    pub fn restore(&mut self, state: CipherState) {
        self.state = state;
    }

    /// Encrypt in place, advancing the keystream
    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let ks = self.next_keystream_byte();
            let c = *byte ^ ks;
            self.feed_back(c);
            *byte = c;
        }
    }

    /// Decrypt in place, advancing the keystream
    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let ks = self.next_keystream_byte();
            let c = *byte;
            self.feed_back(c);
            *byte = c ^ ks;
        }
    }

    /// Decrypt bytes that were encrypted starting at `state`, leaving the
    /// running position untouched
    pub fn decrypt_at(&self, state: CipherState, data: &mut [u8]) {
        let mut scratch = Self {
            cipher: self.cipher.clone(),
            iv: self.iv,
            state,
        };
        scratch.decrypt(data);
    }

    /// Cipher position after `ciphertext` (a prefix of the log starting at
    /// offset 0) has been processed. Only the last block and a half of the
    /// prefix are read: CFB's register is the previous ciphertext block.
    pub fn state_at(&self, ciphertext: &[u8]) -> CipherState {
        let offset = ciphertext.len();
        let pos = offset % AES_BLOCK_LEN;
        let block_start = offset - pos;

        let mut register = if block_start == 0 {
            self.iv
        } else {
            let mut prev = [0u8; AES_BLOCK_LEN];
            prev.copy_from_slice(&ciphertext[block_start - AES_BLOCK_LEN..block_start]);
            prev
        };

        let mut keystream = [0u8; AES_BLOCK_LEN];
        if pos > 0 {
            let mut block = GenericArray::clone_from_slice(&register);
            self.cipher.encrypt_block(&mut block);
            keystream.copy_from_slice(&block);
            register[..pos].copy_from_slice(&ciphertext[block_start..offset]);
        }

        CipherState {
            register,
            keystream,
            pos: pos as u8,
        }
    }

    fn next_keystream_byte(&mut self) -> u8 {
        if self.state.pos == 0 {
            let mut block = GenericArray::clone_from_slice(&self.state.register);
            self.cipher.encrypt_block(&mut block);
            self.state.keystream.copy_from_slice(&block);
        }
        self.state.keystream[self.state.pos as usize]
    }

    fn feed_back(&mut self, ciphertext: u8) {
        let pos = self.state.pos as usize;
        self.state.register[pos] = ciphertext;
        self.state.pos = ((pos + 1) % AES_BLOCK_LEN) as u8;
    }
}

impl std::fmt::Debug for CryptoGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoGuard")
            .field("pos", &self.state.pos)
            .finish_non_exhaustive()
    }
}
