use wawc::crypto::key_pair::KeyPair;
use wawc::crypto::{cbc, hkdf, hmac};
use wawc::{derive_session_keys, AuthError};

/// Builds a conforming 144-byte secret the way the server does: fresh
/// server keys, HKDF over the shared secret, wrapped session keys, HMAC
/// over everything but the tag itself.
fn server_secret(client_public: [u8; 32], enc_key: [u8; 32], mac_key: [u8; 32]) -> Vec<u8> {
    let server_keys = KeyPair::new();
    let shared = server_keys.shared_secret(client_public);
    let expanded = hkdf::expand(&shared, 80, &[]).unwrap();

    let mut key_material = Vec::with_capacity(64);
    key_material.extend_from_slice(&enc_key);
    key_material.extend_from_slice(&mac_key);
    let wrapped = cbc::encrypt(&expanded[..32], &expanded[64..80], &key_material).unwrap();
    assert_eq!(wrapped.len(), 80);

    let mut signed = Vec::with_capacity(112);
    signed.extend_from_slice(&server_keys.public_key);
    signed.extend_from_slice(&wrapped);
    let tag = hmac::sign(&signed, &expanded[32..64]);

    let mut secret = Vec::with_capacity(144);
    secret.extend_from_slice(&server_keys.public_key);
    secret.extend_from_slice(&tag);
    secret.extend_from_slice(&wrapped);
    secret
}

#[test]
fn conforming_secret_yields_the_session_keys() {
    let client_keys = KeyPair::new();
    let secret = server_secret(client_keys.public_key, [0xE1; 32], [0xA2; 32]);
    let (enc_key, mac_key) = derive_session_keys(&client_keys, &secret).unwrap();
    assert_eq!(enc_key, [0xE1; 32]);
    assert_eq!(mac_key, [0xA2; 32]);
}

#[test]
fn zeroed_tag_region_is_an_hmac_mismatch() {
    let client_keys = KeyPair::new();
    let mut secret = server_secret(client_keys.public_key, [1; 32], [2; 32]);
    secret[32..64].fill(0);
    assert!(matches!(
        derive_session_keys(&client_keys, &secret),
        Err(AuthError::HmacMismatch)
    ));
}

#[test]
fn bit_flips_outside_the_tag_fail_validation() {
    let client_keys = KeyPair::new();
    let baseline = server_secret(client_keys.public_key, [1; 32], [2; 32]);
    for index in [0usize, 31, 64, 100, 143] {
        let mut secret = baseline.clone();
        secret[index] ^= 0x01;
        assert!(
            derive_session_keys(&client_keys, &secret).is_err(),
            "flip at byte {index} must not validate"
        );
    }
}

#[test]
fn wrong_length_secret_is_malformed() {
    let client_keys = KeyPair::new();
    assert!(matches!(
        derive_session_keys(&client_keys, &[0u8; 143]),
        Err(AuthError::Malformed(_))
    ));
}

#[test]
fn each_pairing_derives_distinct_keys_for_distinct_clients() {
    let a = KeyPair::new();
    let b = KeyPair::new();
    let secret = server_secret(a.public_key, [9; 32], [10; 32]);
    assert!(derive_session_keys(&a, &secret).is_ok());
    // A different client private key cannot open the same secret.
    assert!(derive_session_keys(&b, &secret).is_err());
}
