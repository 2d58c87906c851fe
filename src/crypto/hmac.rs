use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Computes HMAC-SHA256 of `data` under `key`.
pub fn sign(data: &[u8], key: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Checks `tag` against HMAC-SHA256 of `data` in constant time.
pub fn verify(data: &[u8], key: &[u8], tag: &[u8]) -> bool {
    sign(data, key).as_slice().ct_eq(tag).into()
}
