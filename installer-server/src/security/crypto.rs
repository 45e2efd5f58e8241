// Cryptographic utilities

use anyhow::Result;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

/// Random bytes used for a server-generated signing secret.
pub const GENERATED_SECRET_BYTES: usize = 48;

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute a safe fingerprint for a secret (hash prefix only; never log the raw secret).
pub fn secret_fingerprint(input: &str) -> String {
    let hex = sha256_hex(input.as_bytes());
    format!("sha256:{}", &hex[..12])
}

/// Generate a URL-safe random secret from the OS CSPRNG.
pub fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; GENERATED_SECRET_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("Failed to generate random secret"))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}
