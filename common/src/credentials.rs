//! At-rest credential obfuscation.
//!
//! Secrets are sealed with XXTEA under a 128-bit key and stored as hex. The
//! sealed block carries the plaintext length and a truncated SHA-256 tag so a
//! wrong key or a damaged constant is reported instead of producing garbage.

use core::fmt::{self, Write as _};
use core::sync::atomic::{compiler_fence, Ordering};

use log::info;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::SecretsConfig;

pub const MAX_SECRET_LEN: usize = 64;

const DELTA: u32 = 0x9e37_79b9;
const HEADER_LEN: usize = 8;
const TAG_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretId {
    WifiSsid,
    WifiPassword,
    BrokerUsername,
    BrokerPassword,
}

impl SecretId {
    pub const ALL: [SecretId; 4] = [
        SecretId::WifiSsid,
        SecretId::WifiPassword,
        SecretId::BrokerUsername,
        SecretId::BrokerPassword,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::WifiSsid => "Wifi SSID",
            Self::WifiPassword => "Wifi password",
            Self::BrokerUsername => "MQTT username",
            Self::BrokerPassword => "MQTT password",
        }
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("ciphertext is not valid hex")]
    MalformedHex,
    #[error("ciphertext length {0} is not a whole number of blocks")]
    BadLength(usize),
    #[error("integrity check failed (wrong key or corrupted ciphertext)")]
    IntegrityMismatch,
    #[error("plaintext is not valid utf-8")]
    NotUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("decryption failure for {secret}: {source}")]
    DecryptionFailure {
        secret: SecretId,
        #[source]
        source: CipherError,
    },
}

#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u32; 4]);

impl CipherKey {
    /// Uses the first 16 bytes of `key`, zero padded.
    pub fn from_passphrase(key: &str) -> Self {
        let mut raw = [0_u8; 16];
        for (dst, src) in raw.iter_mut().zip(key.as_bytes()) {
            *dst = *src;
        }
        let mut words = [0_u32; 4];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(words)
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Decrypted secret in a fixed-size buffer, wiped on drop.
pub struct SecretBuf {
    bytes: [u8; MAX_SECRET_LEN],
    len: usize,
    truncated: bool,
}

impl SecretBuf {
    fn from_str_truncated(value: &str) -> Self {
        let mut len = value.len().min(MAX_SECRET_LEN);
        while !value.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0_u8; MAX_SECRET_LEN];
        bytes[..len].copy_from_slice(&value.as_bytes()[..len]);
        Self {
            bytes,
            len,
            truncated: len < value.len(),
        }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated
    }
}

impl Drop for SecretBuf {
    fn drop(&mut self) {
        self.bytes.fill(0);
        compiler_fence(Ordering::SeqCst);
    }
}

impl fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuf(<{} bytes>)", self.len)
    }
}

fn mx(sum: u32, y: u32, z: u32, p: usize, e: usize, key: &[u32; 4]) -> u32 {
    (((z >> 5) ^ (y << 2)).wrapping_add((y >> 3) ^ (z << 4)))
        ^ ((sum ^ y).wrapping_add(key[(p & 3) ^ e] ^ z))
}

fn xxtea_encrypt(v: &mut [u32], key: &[u32; 4]) {
    let n = v.len();
    if n < 2 {
        return;
    }
    let rounds = 6 + 52 / n;
    let mut sum = 0_u32;
    let mut z = v[n - 1];
    for _ in 0..rounds {
        sum = sum.wrapping_add(DELTA);
        let e = ((sum >> 2) & 3) as usize;
        for p in 0..n - 1 {
            let y = v[p + 1];
            v[p] = v[p].wrapping_add(mx(sum, y, z, p, e, key));
            z = v[p];
        }
        let y = v[0];
        v[n - 1] = v[n - 1].wrapping_add(mx(sum, y, z, n - 1, e, key));
        z = v[n - 1];
    }
}

fn xxtea_decrypt(v: &mut [u32], key: &[u32; 4]) {
    let n = v.len();
    if n < 2 {
        return;
    }
    let rounds = 6 + 52 / n;
    let mut sum = (rounds as u32).wrapping_mul(DELTA);
    let mut y = v[0];
    for _ in 0..rounds {
        let e = ((sum >> 2) & 3) as usize;
        for p in (1..n).rev() {
            let z = v[p - 1];
            v[p] = v[p].wrapping_sub(mx(sum, y, z, p, e, key));
            y = v[p];
        }
        let z = v[n - 1];
        v[0] = v[0].wrapping_sub(mx(sum, y, z, 0, e, key));
        y = v[0];
        sum = sum.wrapping_sub(DELTA);
    }
}

fn tag_for(plaintext: &[u8]) -> [u8; TAG_LEN] {
    let digest = Sha256::digest(plaintext);
    [digest[0], digest[1], digest[2], digest[3]]
}

fn to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, CipherError> {
    let raw = raw.trim();
    if raw.len() % 2 != 0 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CipherError::MalformedHex);
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).map_err(|_| CipherError::MalformedHex))
        .collect()
}

/// Seals `plaintext` and returns the hex form stored in configuration.
pub fn encrypt(plaintext: &str, key: &CipherKey) -> String {
    let body = plaintext.as_bytes();
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    let mut block = Vec::with_capacity(HEADER_LEN + body.len() + 3);
    block.extend_from_slice(&len.to_le_bytes());
    block.extend_from_slice(&tag_for(body));
    block.extend_from_slice(body);
    while block.len() % 4 != 0 {
        block.push(0);
    }

    let mut words = to_words(&block);
    block.fill(0);
    xxtea_encrypt(&mut words, &key.0);

    let sealed: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    encode_hex(&sealed)
}

/// Opens a sealed hex string. Fails when the key does not match the one the
/// value was sealed with.
pub fn decrypt(ciphertext: &str, key: &CipherKey) -> Result<SecretBuf, CipherError> {
    let sealed = decode_hex(ciphertext)?;
    if sealed.len() < HEADER_LEN || sealed.len() % 4 != 0 {
        return Err(CipherError::BadLength(sealed.len()));
    }

    let mut words = to_words(&sealed);
    xxtea_decrypt(&mut words, &key.0);
    let mut block: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    words.fill(0);

    let result = open_block(&block);
    block.fill(0);
    result
}

fn open_block(block: &[u8]) -> Result<SecretBuf, CipherError> {
    let len = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    let end = HEADER_LEN
        .checked_add(len)
        .filter(|end| *end <= block.len() && block.len() - *end < 4)
        .ok_or(CipherError::IntegrityMismatch)?;

    let body = &block[HEADER_LEN..end];
    if block[4..HEADER_LEN] != tag_for(body) || block[end..].iter().any(|b| *b != 0) {
        return Err(CipherError::IntegrityMismatch);
    }

    let text = core::str::from_utf8(body).map_err(|_| CipherError::NotUtf8)?;
    Ok(SecretBuf::from_str_truncated(text))
}

/// Plaintext secrets, only present in builds that regenerate the sealed
/// constants.
#[derive(Debug, Clone, Copy)]
pub struct PlainSecrets<'a> {
    pub wifi_ssid: &'a str,
    pub wifi_pass: &'a str,
    pub mqtt_user: &'a str,
    pub mqtt_pass: &'a str,
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    key: CipherKey,
    sealed: SecretsConfig,
}

impl CredentialStore {
    pub fn new(secrets: &SecretsConfig) -> Self {
        Self {
            key: CipherKey::from_passphrase(&secrets.key),
            sealed: secrets.clone(),
        }
    }

    fn sealed(&self, secret: SecretId) -> &str {
        match secret {
            SecretId::WifiSsid => &self.sealed.wifi_ssid,
            SecretId::WifiPassword => &self.sealed.wifi_pass,
            SecretId::BrokerUsername => &self.sealed.mqtt_user,
            SecretId::BrokerPassword => &self.sealed.mqtt_pass,
        }
    }

    /// Decrypts one secret into a fresh buffer. Nothing is cached.
    pub fn decrypt(&self, secret: SecretId) -> Result<SecretBuf, CredentialError> {
        decrypt(self.sealed(secret), &self.key)
            .map_err(|source| CredentialError::DecryptionFailure { secret, source })
    }

    /// Seals all four plaintext secrets under `key`.
    pub fn seal_all(key: &str, plain: &PlainSecrets<'_>) -> SecretsConfig {
        let cipher_key = CipherKey::from_passphrase(key);
        SecretsConfig {
            key: key.to_string(),
            wifi_ssid: encrypt(plain.wifi_ssid, &cipher_key),
            wifi_pass: encrypt(plain.wifi_pass, &cipher_key),
            mqtt_user: encrypt(plain.mqtt_user, &cipher_key),
            mqtt_pass: encrypt(plain.mqtt_pass, &cipher_key),
        }
    }

    /// One-shot dump of the sealed constants to the console.
    pub fn log_encrypted_config(key: &str, plain: &PlainSecrets<'_>) -> SecretsConfig {
        let sealed = Self::seal_all(key, plain);
        let store = Self::new(&sealed);
        for secret in SecretId::ALL {
            info!("--Encrypted {}: {}", secret, store.sealed(secret));
        }
        sealed
    }
}
