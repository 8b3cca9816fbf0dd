//! TOTP multi-factor authentication (RFC 6238) and backup codes

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, Rng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{DotMacError, Result};

const SECRET_BYTES: usize = 20;
const DIGITS: u32 = 6;
const PERIOD_SECS: u64 = 30;
/// Steps accepted either side of the current one
const SKEW_STEPS: i64 = 1;

const BACKUP_CODE_COUNT: usize = 10;
/// No 0/O or 1/I
const BACKUP_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32 without padding
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
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

/// Case-insensitive; ignores spaces, dashes and `=` padding
pub fn base32_decode(input: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in input.chars() {
        if matches!(c, ' ' | '-' | '=') {
            continue;
        }
        let value = match c.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u32 - 'A' as u32,
            c @ '2'..='7' => c as u32 - '2' as u32 + 26,
            _ => return Err(DotMacError::validation(format!("Invalid base32 character '{}'", c))),
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct MfaService {
    issuer: String,
}

impl MfaService {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self { issuer: issuer.into() }
    }

    /// 160-bit random secret, base32 encoded
    pub fn generate_secret(&self) -> String {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        base32_encode(&bytes)
    }

    /// `otpauth://` URI for authenticator apps
    pub fn provisioning_uri(&self, secret: &str, account: &str) -> String {
        let label = format!("{}:{}", self.issuer, account);
        format!(
            "otpauth://totp/{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
            urlencoding::encode(&label),
            secret,
            urlencoding::encode(&self.issuer),
            DIGITS,
            PERIOD_SECS
        )
    }

    fn hotp(key: &[u8], counter: u64) -> Result<String> {
        let mut mac = Hmac::<Sha1>::new_from_slice(key)
            .map_err(|e| DotMacError::internal(format!("Invalid TOTP key: {}", e)))?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // Dynamic truncation
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = ((digest[offset] as u32 & 0x7f) << 24)
            | ((digest[offset + 1] as u32) << 16)
            | ((digest[offset + 2] as u32) << 8)
            | digest[offset + 3] as u32;
        let code = binary % 10u32.pow(DIGITS);
        Ok(format!("{:0width$}", code, width = DIGITS as usize))
    }

    pub fn code_at(&self, secret: &str, unix_secs: u64) -> Result<String> {
        let key = base32_decode(secret)?;
        Self::hotp(&key, unix_secs / PERIOD_SECS)
    }

    /// Accepts codes from the adjacent time steps to tolerate clock drift
    pub fn verify_code(&self, secret: &str, code: &str, unix_secs: u64) -> Result<bool> {
        let code = code.trim().replace(' ', "");
        if code.len() != DIGITS as usize || !code.chars().all(|c| c.is_ascii_digit()) {
            return Ok(false);
        }

        let key = base32_decode(secret)?;
        let step = (unix_secs / PERIOD_SECS) as i64;
        let mut matched = false;
        for offset in -SKEW_STEPS..=SKEW_STEPS {
            let counter = step + offset;
            if counter < 0 {
                continue;
            }
            let expected = Self::hotp(&key, counter as u64)?;
            matched |= bool::from(expected.as_bytes().ct_eq(code.as_bytes()));
        }
        Ok(matched)
    }

    /// Plaintext codes to show the user once, formatted `XXXX-XXXX`
    pub fn generate_backup_codes(&self) -> Vec<String> {
        let mut rng = OsRng;
        (0..BACKUP_CODE_COUNT)
            .map(|_| {
                let chars: String = (0..8)
                    .map(|_| BACKUP_ALPHABET[rng.gen_range(0..BACKUP_ALPHABET.len())] as char)
                    .collect();
                format!("{}-{}", &chars[..4], &chars[4..])
            })
            .collect()
    }

    /// SHA-256 hex of the normalised code
    pub fn hash_backup_code(code: &str) -> String {
        let normalized: String = code
            .chars()
            .filter(|c| !matches!(c, '-' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        hex::encode(Sha256::digest(normalized.as_bytes()))
    }

    /// Index of the matching stored hash. Every hash is compared so timing
    /// does not reveal which one matched.
    pub fn match_backup_code(code: &str, hashes: &[String]) -> Option<usize> {
        let candidate = Self::hash_backup_code(code);
        let mut found = None;
        for (i, stored) in hashes.iter().enumerate() {
            if bool::from(stored.as_bytes().ct_eq(candidate.as_bytes())) && found.is_none() {
                found = Some(i);
            }
        }
        found
    }
}
