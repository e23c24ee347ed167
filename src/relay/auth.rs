//! Credential verification: salted password hashes and RFC 6238 TOTP over
//! HMAC-SHA-256. Secrets are handed out as unpadded base32 so they drop into
//! standard `otpauth://` provisioning strings.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::relay::users::{User, UserStore};

const TOTP_STEP_SECONDS: i64 = 30;
const TOTP_DIGITS: u32 = 6;
const TOTP_SKEW_STEPS: i64 = 1;

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

pub struct Authenticator {
    users: std::sync::Arc<UserStore>,
}

impl Authenticator {
    pub fn new(users: std::sync::Arc<UserStore>) -> Authenticator {
        Authenticator { users }
    }

    pub fn validate(
        &self,
        username: &str,
        password: &str,
        totp: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<User> {
        let user = self
            .users
            .get(username)
            .ok_or_else(|| anyhow::anyhow!("invalid credentials"))?;
        if !verify_password(&user.password_hash, password) {
            anyhow::bail!("invalid credentials");
        }
        if !verify_totp(&user.totp_secret, totp, now) {
            anyhow::bail!("invalid credentials");
        }
        Ok(user)
    }
}

/// `salt$digest` with a random 16-byte salt; both halves hex.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = salted_digest(&salt, password);
    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    let Some((salt_hex, digest_hex)) = hash.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest_hex) else {
        return false;
    };
    let actual = salted_digest(&salt, password);
    constant_time_eq(&actual, &expected)
}

fn salted_digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
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

pub fn generate_password() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn generate_totp_secret() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32_encode(&bytes)
}

pub fn totp_url(username: &str, secret: &str) -> String {
    format!("otpauth://totp/cove:{username}?secret={secret}&issuer=cove&algorithm=SHA256&digits={TOTP_DIGITS}&period={TOTP_STEP_SECONDS}")
}

/// Verify a TOTP code, accepting ±1 step of clock skew.
pub fn verify_totp(secret: &str, code: &str, now: DateTime<Utc>) -> bool {
    let Some(key) = base32_decode(secret) else {
        return false;
    };
    if code.len() != TOTP_DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let step = now.timestamp() / TOTP_STEP_SECONDS;
    for skew in -TOTP_SKEW_STEPS..=TOTP_SKEW_STEPS {
        if totp_code(&key, step + skew) == code {
            return true;
        }
    }
    false
}

pub fn totp_code_at(secret: &str, now: DateTime<Utc>) -> Option<String> {
    let key = base32_decode(secret)?;
    Some(totp_code(&key, now.timestamp() / TOTP_STEP_SECONDS))
}

fn totp_code(key: &[u8], step: i64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&(step as u64).to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]) % 10u32.pow(TOTP_DIGITS);
    format!("{:0width$}", code, width = TOTP_DIGITS as usize)
}

fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut buffer = 0u64;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = buffer << 8 | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer = 0u64;
    let mut bits = 0u32;
    for ch in text.bytes() {
        if ch == b'=' {
            continue;
        }
        let value = BASE32_ALPHABET
            .iter()
            .position(|&c| c == ch.to_ascii_uppercase())? as u64;
        buffer = buffer << 5 | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter2");
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
        assert!(!verify_password("garbage", "hunter2"));
    }

    #[test]
    fn hashes_are_salted() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn base32_round_trip() {
        let data = b"\x00\x01\x02\xfe\xff secret";
        let encoded = base32_encode(data);
        assert_eq!(base32_decode(&encoded).unwrap(), data.to_vec());
    }

    #[test]
    fn totp_accepts_current_and_adjacent_steps() {
        let secret = generate_totp_secret();
        let now = Utc::now();
        let code = totp_code_at(&secret, now).unwrap();
        assert!(verify_totp(&secret, &code, now));
        let drifted = now + chrono::Duration::seconds(TOTP_STEP_SECONDS);
        assert!(verify_totp(&secret, &code, drifted));
        let far = now + chrono::Duration::seconds(TOTP_STEP_SECONDS * 3);
        assert!(!verify_totp(&secret, &code, far));
    }

    #[test]
    fn totp_rejects_malformed_codes() {
        let secret = generate_totp_secret();
        let now = Utc::now();
        assert!(!verify_totp(&secret, "12345", now));
        assert!(!verify_totp(&secret, "abcdef", now));
        assert!(!verify_totp("not base32!", "123456", now));
    }
}
