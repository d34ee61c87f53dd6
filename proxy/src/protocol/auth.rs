//! MySQL authentication plugins
//!
//! - `mysql_native_password`: SHA1 scramble, used by the proxy's own front door
//! - `caching_sha2_password`: SHA256 scramble, the MySQL 8 default
//! - `mysql_clear_password`: plain secret, required for IAM and AAD tokens

use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// `mysql_native_password`
pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
/// `caching_sha2_password`
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
/// `mysql_clear_password`
pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";

/// caching_sha2_password: server asks for the RSA public key
pub const CACHING_SHA2_REQUEST_PUBLIC_KEY: u8 = 0x02;
/// caching_sha2_password: cached scramble accepted
pub const CACHING_SHA2_FAST_AUTH_SUCCESS: u8 = 0x03;
/// caching_sha2_password: server wants the full password
pub const CACHING_SHA2_PERFORM_FULL_AUTH: u8 = 0x04;

/// Length of the auth plugin data the proxy generates
pub const SCRAMBLE_LEN: usize = 20;

/// Authentication plugins the proxy can answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    /// `mysql_native_password`
    NativePassword,
    /// `caching_sha2_password`
    CachingSha2Password,
    /// `mysql_clear_password`
    ClearPassword,
}

impl AuthPlugin {
    /// Look up a plugin by its protocol name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            MYSQL_NATIVE_PASSWORD => Some(AuthPlugin::NativePassword),
            CACHING_SHA2_PASSWORD => Some(AuthPlugin::CachingSha2Password),
            MYSQL_CLEAR_PASSWORD => Some(AuthPlugin::ClearPassword),
            _ => None,
        }
    }

    /// Protocol name of the plugin
    pub fn name(&self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2Password => CACHING_SHA2_PASSWORD,
            AuthPlugin::ClearPassword => MYSQL_CLEAR_PASSWORD,
        }
    }

    /// Auth response for `password` given the server's plugin data
    pub fn auth_response(&self, password: &str, scramble: &[u8]) -> Vec<u8> {
        match self {
            AuthPlugin::NativePassword => scramble_native_password(password, scramble),
            AuthPlugin::CachingSha2Password => scramble_caching_sha2(password, scramble),
            AuthPlugin::ClearPassword => clear_password(password),
        }
    }
}

/// Generate random auth plugin data
pub fn generate_scramble() -> [u8; SCRAMBLE_LEN] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; SCRAMBLE_LEN];
    for byte in scramble.iter_mut() {
        // Printable ASCII keeps the scramble free of nulls
        *byte = rng.gen_range(0x21..0x7f);
    }
    scramble
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`
pub fn scramble_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    xor(&stage1, &hasher.finalize())
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)`
pub fn scramble_caching_sha2(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(scramble);
    xor(&stage1, &hasher.finalize())
}

/// Null-terminated clear text password
pub fn clear_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Stored form of a `mysql_native_password` secret: `SHA1(SHA1(password))`
pub fn native_password_hash(password: &str) -> [u8; 20] {
    let stage2 = Sha1::digest(Sha1::digest(password.as_bytes()));
    let mut out = [0u8; 20];
    out.copy_from_slice(&stage2);
    out
}

/// Check a `mysql_native_password` response against a stored hash
pub fn verify_native_password(response: &[u8], scramble: &[u8], stored_hash: &[u8; 20]) -> bool {
    if response.len() != 20 {
        return false;
    }
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stored_hash);
    let stage1 = xor(response, &hasher.finalize());
    let candidate = Sha1::digest(&stage1);

    // Compare without short-circuiting on the first mismatch
    candidate
        .iter()
        .zip(stored_hash.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
