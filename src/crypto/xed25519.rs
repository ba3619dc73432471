//! XEd25519 signatures over X25519 keys, as the signal protocol requires for
//! signed pre-keys and the ADV device identity.

use xeddsa::xed25519::{PrivateKey, PublicKey};

pub fn sign(private_key_bytes: &[u8; 32], message: &[u8]) -> [u8; 64] {
    let priv_key = PrivateKey(*private_key_bytes);
    <PrivateKey as xeddsa::xeddsa::Sign<[u8; 64], [u8; 32], [u8; 32]>>::sign(
        &priv_key, message, rand10::rng(),
    )
}

pub fn verify(public_key_bytes: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let pub_key = PublicKey(*public_key_bytes);
    <PublicKey as xeddsa::xeddsa::Verify<[u8; 64], [u8; 32]>>::verify(
        &pub_key, message, signature,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::KeyPair;

    #[test]
    fn sign_verify_round_trip() {
        let pair = KeyPair::new();
        let sig = sign(&pair.private_key, b"hello");
        assert!(verify(&pair.public_key, b"hello", &sig));
        assert!(!verify(&pair.public_key, b"tampered", &sig));
    }
}
