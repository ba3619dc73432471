use crate::socket::error::{Result, SocketError};
use aes_gcm::aead::Aead;
use aes_gcm::Aes256Gcm;
use std::sync::atomic::{AtomicU32, Ordering};

/// Per-frame GCM nonce: 8 zero bytes then the frame counter, big-endian.
pub fn generate_iv(counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// Post-handshake frame encryption. Send and receive directions hold
/// independent keys and counters derived from the handshake hash.
pub struct NoiseSocket {
    write_key: Aes256Gcm,
    read_key: Aes256Gcm,
    write_counter: AtomicU32,
    read_counter: AtomicU32,
}

impl NoiseSocket {
    pub fn new(write_key: Aes256Gcm, read_key: Aes256Gcm) -> Self {
        Self {
            write_key,
            read_key,
            write_counter: AtomicU32::new(0),
            read_counter: AtomicU32::new(0),
        }
    }

    pub fn encrypt_frame(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.write_counter.fetch_add(1, Ordering::SeqCst);
        let iv = generate_iv(counter);
        self.write_key
            .encrypt(iv.as_ref().into(), plaintext)
            .map_err(|e| SocketError::Crypto(e.to_string()))
    }

    /// A failed MAC here is fatal to the connection: the counters are out of
    /// step and no later frame can decrypt.
    pub fn decrypt_frame(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.read_counter.fetch_add(1, Ordering::SeqCst);
        let iv = generate_iv(counter);
        self.read_key
            .decrypt(iv.as_ref().into(), ciphertext)
            .map_err(|e| SocketError::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::KeyInit;

    fn socket_pair() -> (NoiseSocket, NoiseSocket) {
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        let a = NoiseSocket::new(
            Aes256Gcm::new_from_slice(&key_a).unwrap(),
            Aes256Gcm::new_from_slice(&key_b).unwrap(),
        );
        let b = NoiseSocket::new(
            Aes256Gcm::new_from_slice(&key_b).unwrap(),
            Aes256Gcm::new_from_slice(&key_a).unwrap(),
        );
        (a, b)
    }

    #[test]
    fn counters_keep_both_directions_in_step() {
        let (a, b) = socket_pair();
        for i in 0u8..4 {
            let frame = a.encrypt_frame(&[i; 16]).unwrap();
            assert_eq!(b.decrypt_frame(&frame).unwrap(), vec![i; 16]);
        }
        let from_b = b.encrypt_frame(b"reply").unwrap();
        assert_eq!(a.decrypt_frame(&from_b).unwrap(), b"reply");
    }

    #[test]
    fn dropped_frame_desynchronizes_the_stream() {
        let (a, b) = socket_pair();
        let _lost = a.encrypt_frame(b"first").unwrap();
        let second = a.encrypt_frame(b"second").unwrap();
        // Receiver still expects counter 0, so the MAC check fails.
        assert!(b.decrypt_frame(&second).is_err());
    }
}
