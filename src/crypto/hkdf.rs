use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("Invalid output length for HKDF expand")]
    InvalidLength,
}

/// Expands input keying material with HKDF-SHA256.
///
/// The protocol fixes the salt to 32 zero bytes; `info` is empty for the
/// session key derivation and carries a media-type tag for media keys.
pub fn expand(ikm: &[u8], length: usize, info: &[u8]) -> Result<Vec<u8>, HkdfError> {
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_is_deterministic() {
        let a = expand(b"input keying material", 80, &[]).unwrap();
        let b = expand(b"input keying material", 80, &[]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 80);
    }

    #[test]
    fn info_tag_changes_output() {
        let plain = expand(b"ikm", 32, &[]).unwrap();
        let tagged = expand(b"ikm", 32, b"WhatsApp Image Keys").unwrap();
        assert_ne!(plain, tagged);
    }

    #[test]
    fn overlong_output_is_rejected() {
        // HKDF-SHA256 caps output at 255 * 32 bytes
        assert!(expand(b"ikm", 256 * 32, &[]).is_err());
    }
}
