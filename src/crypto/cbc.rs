use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

pub const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CbcError {
    #[error("Invalid key or IV length for CBC mode: {0}")]
    InvalidLength(#[from] cipher::InvalidLength),
    #[error("Cipher operation failed during padding/unpadding")]
    CipherError,
    #[error("Invalid padding")]
    InvalidPadding,
    #[error("Ciphertext too short to carry an IV")]
    MissingIv,
}

type Result<T> = std::result::Result<T, CbcError>;

/// Encrypts plaintext using AES-256-CBC with PKCS#7 padding under an
/// explicit IV.
pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv)?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Encrypts plaintext under a fresh random IV and prepends that IV to the
/// ciphertext, the layout every encrypted frame uses on the wire.
pub fn encrypt_prefixed(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = encrypt(key, &iv, plaintext)?;
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts ciphertext using AES-256-CBC with manual padding removal.
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CbcError::InvalidLength(cipher::InvalidLength));
    }
    let mut buf = ciphertext.to_vec();
    Aes256CbcDec::new_from_slices(key, iv)?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| CbcError::CipherError)?;
    unpad(&buf).map(|d| d.to_vec())
}

/// Decrypts a ciphertext that carries its IV in the leading 16 bytes.
pub fn decrypt_prefixed(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < IV_LEN {
        return Err(CbcError::MissingIv);
    }
    let (iv, body) = ciphertext.split_at(IV_LEN);
    decrypt(key, iv, body)
}

fn unpad(data: &[u8]) -> Result<&[u8]> {
    if data.is_empty() {
        return Err(CbcError::InvalidPadding);
    }
    let pad_len_byte = data[data.len() - 1];
    let pad_len = pad_len_byte as usize;

    if pad_len == 0 || pad_len > data.len() {
        return Err(CbcError::InvalidPadding);
    }

    let (unpadded_data, padding) = data.split_at(data.len() - pad_len);
    for &byte in padding {
        if byte != pad_len_byte {
            return Err(CbcError::InvalidPadding);
        }
    }
    Ok(unpadded_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn prefixed_round_trip() {
        let plaintext = b"the quick brown fox";
        let ciphertext = encrypt_prefixed(&KEY, plaintext).unwrap();
        assert_ne!(&ciphertext[IV_LEN..], plaintext.as_slice());
        assert_eq!(decrypt_prefixed(&KEY, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn explicit_iv_round_trip() {
        let iv = [9u8; IV_LEN];
        let ciphertext = encrypt(&KEY, &iv, b"media body").unwrap();
        assert_eq!(decrypt(&KEY, &iv, &ciphertext).unwrap(), b"media body");
    }

    #[test]
    fn block_aligned_input_grows_by_one_block() {
        let ciphertext = encrypt(&KEY, &[0u8; IV_LEN], &[0u8; 64]).unwrap();
        assert_eq!(ciphertext.len(), 80);
    }

    #[test]
    fn corrupted_ciphertext_fails_padding() {
        let mut ciphertext = encrypt_prefixed(&KEY, b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(decrypt_prefixed(&KEY, &ciphertext).is_err());
    }

    #[test]
    fn short_ciphertext_has_no_iv() {
        assert!(matches!(
            decrypt_prefixed(&KEY, &[0u8; 8]),
            Err(CbcError::MissingIv)
        ));
    }
}
