//! # Fragment Envelope Module
//!
//! Symmetric encryption of individual radio fragments.
//!
//! Every on-air frame is exactly one AES-128 block, so the envelope is a
//! single-block electronic-codebook operation: no chaining, no padding, no
//! nonce. The 128-bit pre-shared key is loaded once at initialization and
//! must match on every node of a deployment.
//!
//! The envelope is unauthenticated. A flipped ciphertext bit decrypts to
//! random plaintext, which the dispatcher discards when the type nibble does
//! not match a known packet type. See the dispatcher for the drop path.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

use crate::RADIO_PACKET_SIZE;

/// Single-block cipher wrapper used for every fragment on the air.
///
/// Construction expands the key schedule once; `encrypt` and `decrypt` are
/// total functions on 16-byte buffers and never fail.
pub struct Envelope {
    cipher: Aes128,
}

impl Envelope {
    /// Builds the envelope from the deployment's 128-bit pre-shared key.
    pub fn new(key: &[u8; 16]) -> Self {
        Envelope {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    /// Encrypts one fragment block in place.
    pub fn encrypt(&self, block: &mut [u8; RADIO_PACKET_SIZE]) {
        self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    /// Decrypts one fragment block in place.
    pub fn decrypt(&self, block: &mut [u8; RADIO_PACKET_SIZE]) {
        self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
}
