//! Password hashing for the user directory.
//!
//! Stored form: `pbkdf2$<iterations>$<salt-hex>$<hash-hex>` using
//! PBKDF2-HMAC-SHA256 with a per-user random salt. Verification re-derives
//! and compares in constant time.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// PBKDF2 iteration count for newly hashed passwords.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = pbkdf2_sha256(password.as_bytes(), &salt, PBKDF2_ITERATIONS);
    format!(
        "pbkdf2${}${}${}",
        PBKDF2_ITERATIONS,
        hex_encode(&salt),
        hex_encode(&hash)
    )
}

/// Verify a password against a stored `pbkdf2$...` string.
/// Unparseable stored values never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    if parts.len() != 4 || parts[0] != "pbkdf2" {
        return false;
    }
    let Ok(iterations) = parts[1].parse::<u32>() else {
        return false;
    };
    let (Some(salt), Some(expected)) = (hex_decode(parts[2]), hex_decode(parts[3])) else {
        return false;
    };
    if expected.len() != HASH_LEN || iterations == 0 {
        return false;
    }
    let actual = pbkdf2_sha256(password.as_bytes(), &salt, iterations);
    constant_time_eq(&actual, &expected)
}

/// Single-block PBKDF2-HMAC-SHA256 (32-byte output).
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    // U1 = HMAC(P, S ‖ INT(1)); Ui = HMAC(P, U(i-1)); F = U1 ^ ... ^ Uc
    let mut mac = HmacSha256::new_from_slice(password).expect("HMAC accepts any key length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u: [u8; HASH_LEN] = mac.finalize().into_bytes().into();
    let mut out = u;

    for _ in 1..iterations {
        let mut mac = HmacSha256::new_from_slice(password).expect("HMAC accepts any key length");
        mac.update(&u);
        u = mac.finalize().into_bytes().into();
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
