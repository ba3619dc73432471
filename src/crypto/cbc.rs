use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, Error)]
pub enum CbcError {
    #[error("invalid key or iv length for AES-CBC")]
    InvalidLength,
    #[error("bad PKCS7 padding in AES-CBC ciphertext")]
    BadPadding,
}

pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CbcError> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CbcError::InvalidLength)?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CbcError> {
    let dec = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CbcError::InvalidLength)?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CbcError::BadPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [3u8; 32];
        let iv = [9u8; 16];
        let ct = encrypt(&key, &iv, b"the quick brown fox").unwrap();
        assert_eq!(ct.len() % 16, 0);
        assert_eq!(decrypt(&key, &iv, &ct).unwrap(), b"the quick brown fox");
    }
}
