//! Authentication plugin scrambles.

use sha1::Sha1;
use sha2::{
    Digest,
    Sha256,
};

fn xor(mut lhs: Vec<u8>, rhs: &[u8]) -> Vec<u8> {
    for (l, r) in lhs.iter_mut().zip(rhs) {
        *l ^= r;
    }
    lhs
}

/// `mysql_native_password`:
/// `SHA1(password) XOR SHA1(nonce ++ SHA1(SHA1(password)))`.
pub(crate) fn scramble_native(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);
    let mut salted = Sha1::new();
    salted.update(nonce);
    salted.update(stage2);
    xor(stage1.to_vec(), &salted.finalize())
}

/// `caching_sha2_password` fast path:
/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) ++ nonce)`.
pub(crate) fn scramble_caching_sha2(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);
    let mut salted = Sha256::new();
    salted.update(stage2);
    salted.update(nonce);
    xor(stage1.to_vec(), &salted.finalize())
}
