//! RSA key management for device authentication.
//!
//! Keys live where the stock tools keep them: a PEM private key (`adbkey`)
//! next to a one-line public key (`adbkey.pub`) in the device's own format:
//!
//! ```text
//! base64(len, n0inv, n[len], rr[len], exponent) user@host
//! ```
//!
//! where `len` is the modulus size in 32-bit words, `n0inv` is `-1 / n[0]`
//! modulo 2^32, and `rr` is `(2^(32 * len))^2 mod n`. Every word is
//! little-endian.

use std::fs;
use std::path::{Path, PathBuf};

use adb_protocol::RsaSigner;
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Size of keys generated by [`generate`].
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Path of the public key matching a private key path.
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

/// `user@host` comment appended to generated public keys.
pub fn default_comment() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{}@{}", user, host)
}

/// Reads a PKCS#8 or PKCS#1 PEM private key.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = fs::read_to_string(path)
        .with_context(|| format!("Failed to read private key: {}", path.display()))?;

    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| anyhow::anyhow!("Invalid private key {}: {}", path.display(), e))
}

/// Loads a signer from a private key and its `.pub` companion.
///
/// When the `.pub` file is missing the public key is derived from the
/// private key.
pub fn load_signer(path: &Path) -> Result<RsaSigner> {
    let key = load_private_key(path)?;

    let pub_path = public_key_path(path);
    let public_key = if pub_path.exists() {
        let line = fs::read_to_string(&pub_path)
            .with_context(|| format!("Failed to read public key: {}", pub_path.display()))?;
        line.trim_end().as_bytes().to_vec()
    } else {
        tracing::debug!("No public key at {:?}, deriving it", pub_path);
        encode_public_key(&RsaPublicKey::from(&key), &default_comment())?.into_bytes()
    };

    Ok(RsaSigner::new(key, public_key)?)
}

/// Loads every usable signer from `paths`, in order.
///
/// Missing files are skipped quietly; unreadable or invalid keys are skipped
/// with a warning.
pub fn load_signers(paths: &[PathBuf]) -> Vec<RsaSigner> {
    let mut signers = Vec::new();
    for path in paths {
        if !path.exists() {
            tracing::debug!("Key not found at {:?}, skipping", path);
            continue;
        }
        match load_signer(path) {
            Ok(signer) => {
                tracing::debug!(bits = signer.modulus_len() * 8, "Loaded key {:?}", path);
                signers.push(signer);
            }
            Err(e) => tracing::warn!("Skipping key {:?}: {:#}", path, e),
        }
    }
    signers
}

/// Encodes a public key in the device's binary layout.
pub fn android_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    let bits = key.n().bits();
    if bits == 0 || bits % 32 != 0 {
        bail!("modulus of {} bits is not a whole number of 32-bit words", bits);
    }
    let words = bits / 32;
    let width = words * 4;

    let n = key.n();
    let n_bytes = to_le_fixed(n, width);
    let n0 = u32::from_le_bytes([n_bytes[0], n_bytes[1], n_bytes[2], n_bytes[3]]);
    let n0inv = inverse_mod_2_32(n0).wrapping_neg();

    let r = BigUint::from(1u32) << (32 * words);
    let rr = (&r * &r) % n;

    let e = key.e().to_bytes_le();
    if e.len() > 4 {
        bail!("public exponent does not fit in 32 bits");
    }

    let mut out = Vec::with_capacity(4 + 4 + width * 2 + 4);
    out.extend_from_slice(&(words as u32).to_le_bytes());
    out.extend_from_slice(&n0inv.to_le_bytes());
    out.extend_from_slice(&n_bytes);
    out.extend_from_slice(&to_le_fixed(&rr, width));
    out.extend_from_slice(&to_le_fixed(&BigUint::from_bytes_le(&e), 4));
    Ok(out)
}

/// Formats the `.pub` line for `key`.
pub fn encode_public_key(key: &RsaPublicKey, comment: &str) -> Result<String> {
    let encoded = STANDARD.encode(android_public_key(key)?);
    Ok(format!("{} {}", encoded, comment))
}

/// Parses a `.pub` line (or bare base64) back into an RSA public key.
pub fn parse_public_key(line: &str) -> Result<RsaPublicKey> {
    let encoded = line.split_whitespace().next().unwrap_or_default();
    let raw = STANDARD
        .decode(encoded.trim_end_matches('\0'))
        .context("Public key is not valid base64")?;

    if raw.len() < 8 {
        bail!("public key too short: {} bytes", raw.len());
    }
    let words = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let width = words * 4;
    let expected = 4 + 4 + width * 2 + 4;
    if raw.len() != expected {
        bail!(
            "public key for {} words must be {} bytes, got {}",
            words,
            expected,
            raw.len()
        );
    }

    let n = BigUint::from_bytes_le(&raw[8..8 + width]);
    let e = BigUint::from_bytes_le(&raw[8 + width * 2..]);
    RsaPublicKey::new(n, e).context("Public key parameters are invalid")
}

/// SHA-256 fingerprint of the binary public key, as `SHA256:<base64>`.
pub fn fingerprint(public_key_line: &str) -> Result<String> {
    let key = parse_public_key(public_key_line)?;
    let digest = Sha256::digest(android_public_key(&key)?);
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

/// Generates a new key pair and writes `path` and `path.pub`.
///
/// Refuses to overwrite an existing private key.
pub fn generate(path: &Path, bits: usize) -> Result<RsaSigner> {
    if path.exists() {
        bail!("Refusing to overwrite existing key: {}", path.display());
    }

    tracing::info!(bits, "Generating RSA key");
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits).context("Failed to generate key")?;
    save_key_pair(path, &key, &default_comment())
}

/// Writes `key` as a PKCS#8 PEM to `path` and its public key to `path.pub`.
pub fn save_key_pair(path: &Path, key: &RsaPrivateKey, comment: &str) -> Result<RsaSigner> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
    }

    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("Failed to encode private key: {}", e))?;
    fs::write(path, pem.as_bytes())
        .with_context(|| format!("Failed to write private key: {}", path.display()))?;
    restrict_permissions(path)?;

    let public_line = encode_public_key(&RsaPublicKey::from(key), comment)?;
    let pub_path = public_key_path(path);
    fs::write(&pub_path, format!("{}\n", public_line))
        .with_context(|| format!("Failed to write public key: {}", pub_path.display()))?;

    tracing::debug!("Key pair saved to {:?}", path);
    Ok(RsaSigner::new(key.clone(), public_line.into_bytes())?)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn to_le_fixed(value: &BigUint, width: usize) -> Vec<u8> {
    let mut bytes = value.to_bytes_le();
    bytes.resize(width, 0);
    bytes
}

/// Multiplicative inverse of an odd `x` modulo 2^32 (Newton iteration).
fn inverse_mod_2_32(x: u32) -> u32 {
    let mut inv: u32 = 1;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(x.wrapping_mul(inv)));
    }
    inv
}
