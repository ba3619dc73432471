use crate::socket::error::{Result, SocketError};
use crate::socket::noise_socket::{generate_iv, NoiseSocket};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::x25519;

fn sha256_slice(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The frame/message cipher; every derived key here is exactly 32 bytes.
fn aead_cipher(secret: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new_from_slice(secret).expect("aes-256 keys are 32 bytes")
}

/// Symmetric state for the Noise XX handshake: the rolling transcript hash,
/// the HKDF salt chain, and the current message key.
pub struct NoiseHandshake {
    hash: [u8; 32],
    salt: [u8; 32],
    key: Aes256Gcm,
    counter: u32,
}

impl NoiseHandshake {
    pub fn new(pattern: &str, header: &[u8]) -> Self {
        let h: [u8; 32] = if pattern.len() == 32 {
            pattern.as_bytes().try_into().expect("length checked")
        } else {
            sha256_slice(pattern.as_bytes())
        };

        let mut state = Self {
            hash: h,
            salt: h,
            key: aead_cipher(&h),
            counter: 0,
        };
        state.authenticate(header);
        state
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Folds data into the transcript hash.
    pub fn authenticate(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    fn next_counter(&mut self) -> u32 {
        let count = self.counter;
        self.counter += 1;
        count
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv = generate_iv(self.next_counter());
        let ciphertext = self
            .key
            .encrypt(
                iv.as_ref().into(),
                Payload {
                    msg: plaintext,
                    aad: &self.hash,
                },
            )
            .map_err(|e| SocketError::Crypto(e.to_string()))?;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        // The transcript hash before this message is the AAD; it only
        // advances once the MAC checks out.
        let aad = self.hash;
        let iv = generate_iv(self.next_counter());
        let plaintext = self
            .key
            .decrypt(
                iv.as_ref().into(),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| SocketError::Crypto(format!("noise decrypt failed: {e}")))?;
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    pub fn mix_shared_secret(&mut self, priv_key: &[u8; 32], pub_key: &[u8; 32]) -> Result<()> {
        let shared = x25519(*priv_key, *pub_key);
        self.counter = 0;
        let (write, read) = self.extract_and_expand(&shared)?;
        self.salt = write;
        self.key = aead_cipher(&read);
        Ok(())
    }

    /// One HKDF step over the salt chain, splitting the output into the
    /// next salt and key halves.
    fn extract_and_expand(&self, ikm: &[u8]) -> Result<([u8; 32], [u8; 32])> {
        let mut okm = [0u8; 64];
        Hkdf::<Sha256>::new(Some(&self.salt), ikm)
            .expand(&[], &mut okm)
            .map_err(|e| SocketError::Crypto(e.to_string()))?;
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        first.copy_from_slice(&okm[..32]);
        second.copy_from_slice(&okm[32..]);
        Ok((first, second))
    }

    /// Consumes the handshake, deriving the frame keys for both directions.
    pub fn finish(self) -> Result<NoiseSocket> {
        let (write_bytes, read_bytes) = self.extract_and_expand(&[])?;
        Ok(NoiseSocket::new(
            aead_cipher(&write_bytes),
            aead_cipher(&read_bytes),
        ))
    }

    /// Server-role finish: the derivation is symmetric, so the responder
    /// swaps the two keys.
    pub fn finish_responder(self) -> Result<NoiseSocket> {
        let (write_bytes, read_bytes) = self.extract_and_expand(&[])?;
        Ok(NoiseSocket::new(
            aead_cipher(&read_bytes),
            aead_cipher(&write_bytes),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::KeyPair;
    use crate::socket::consts::{NOISE_START_PATTERN, WA_CONN_HEADER};

    /// Drives both halves of the XX pattern locally and checks the derived
    /// transports agree.
    #[test]
    fn full_xx_handshake_between_local_peers() {
        let client_ephemeral = KeyPair::new();
        let client_static = KeyPair::new();
        let server_ephemeral = KeyPair::new();
        let server_static = KeyPair::new();

        let mut client = NoiseHandshake::new(NOISE_START_PATTERN, &WA_CONN_HEADER);
        let mut server = NoiseHandshake::new(NOISE_START_PATTERN, &WA_CONN_HEADER);

        // -> e
        client.authenticate(&client_ephemeral.public_key);
        server.authenticate(&client_ephemeral.public_key);

        // <- e, ee, s, es
        client.authenticate(&server_ephemeral.public_key);
        server.authenticate(&server_ephemeral.public_key);
        client
            .mix_shared_secret(&client_ephemeral.private_key, &server_ephemeral.public_key)
            .unwrap();
        server
            .mix_shared_secret(&server_ephemeral.private_key, &client_ephemeral.public_key)
            .unwrap();

        let static_ct = server.encrypt(&server_static.public_key).unwrap();
        let static_pt = client.decrypt(&static_ct).unwrap();
        assert_eq!(static_pt, server_static.public_key);

        client
            .mix_shared_secret(&client_ephemeral.private_key, &server_static.public_key)
            .unwrap();
        server
            .mix_shared_secret(&server_static.private_key, &client_ephemeral.public_key)
            .unwrap();

        let cert_ct = server.encrypt(b"certificate-chain").unwrap();
        assert_eq!(client.decrypt(&cert_ct).unwrap(), b"certificate-chain");

        // -> s, se
        let client_static_ct = client.encrypt(&client_static.public_key).unwrap();
        let client_static_pt = server.decrypt(&client_static_ct).unwrap();
        assert_eq!(client_static_pt, client_static.public_key);

        client
            .mix_shared_secret(&client_static.private_key, &server_ephemeral.public_key)
            .unwrap();
        server
            .mix_shared_secret(&server_ephemeral.private_key, &client_static.public_key)
            .unwrap();

        let payload_ct = client.encrypt(b"client-payload").unwrap();
        assert_eq!(server.decrypt(&payload_ct).unwrap(), b"client-payload");

        // Derived transports must interoperate in both directions.
        let client_socket = client.finish().unwrap();
        let server_socket = server.finish_responder().unwrap();

        let frame = client_socket.encrypt_frame(b"first stanza").unwrap();
        assert_eq!(server_socket.decrypt_frame(&frame).unwrap(), b"first stanza");
        let reply = server_socket.encrypt_frame(b"server reply").unwrap();
        assert_eq!(client_socket.decrypt_frame(&reply).unwrap(), b"server reply");
    }

    #[test]
    fn tampered_handshake_ciphertext_fails_mac() {
        let client_ephemeral = KeyPair::new();
        let server_ephemeral = KeyPair::new();

        let mut client = NoiseHandshake::new(NOISE_START_PATTERN, &WA_CONN_HEADER);
        let mut server = NoiseHandshake::new(NOISE_START_PATTERN, &WA_CONN_HEADER);

        for hs in [&mut client, &mut server] {
            hs.authenticate(&client_ephemeral.public_key);
            hs.authenticate(&server_ephemeral.public_key);
        }
        client
            .mix_shared_secret(&client_ephemeral.private_key, &server_ephemeral.public_key)
            .unwrap();
        server
            .mix_shared_secret(&server_ephemeral.private_key, &client_ephemeral.public_key)
            .unwrap();

        let mut ct = server.encrypt(b"static-key").unwrap();
        ct[0] ^= 0xFF;
        assert!(client.decrypt(&ct).is_err());
    }
}
