//! Signing capability used during the AUTH exchange.
//!
//! The device sends a 20-byte token; the host answers with an RSA signature
//! over the SHA-1 DigestInfo prefix followed by the raw token. The token is
//! never hashed, so padding and exponentiation are done here rather than
//! through a library's hash-then-sign API.

use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};

use crate::error::{AdbError, Result};

/// ASN.1 DigestInfo prefix for SHA-1 (RFC 3447, section 9.2).
pub const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

/// Length of the challenge token adbd sends.
pub const TOKEN_SIZE: usize = 20;

/// Minimum PKCS#1 v1.5 overhead: `00 01`, eight `FF`, `00`.
const PADDING_OVERHEAD: usize = 11;

/// Something that can answer an AUTH challenge.
///
/// Several signers may be configured; the handshake tries them in order and
/// offers the first one's public key if every signature is refused.
pub trait AuthSigner {
    /// Signs the device-issued token.
    fn sign(&self, token: &[u8]) -> Result<Vec<u8>>;

    /// Public key in the form the device stores, without a trailing NUL.
    fn public_key(&self) -> Vec<u8>;
}

impl<S: AuthSigner + ?Sized> AuthSigner for Box<S> {
    fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
        (**self).sign(token)
    }

    fn public_key(&self) -> Vec<u8> {
        (**self).public_key()
    }
}

/// Pads `message` to `target_length` bytes as `00 01 FF.. 00 message`.
///
/// Fails with [`AdbError::Overflow`] when fewer than eight padding bytes
/// would fit.
pub fn pad_for_signing(message: &[u8], target_length: usize) -> Result<Vec<u8>> {
    let max_length = target_length.saturating_sub(PADDING_OVERHEAD);
    if message.len() > max_length {
        return Err(AdbError::Overflow(format!(
            "{} bytes needed for message, but there is only space for {}",
            message.len(),
            max_length
        )));
    }

    let padding_length = target_length - message.len() - 3;
    let mut block = Vec::with_capacity(target_length);
    block.extend_from_slice(&[0x00, 0x01]);
    block.resize(2 + padding_length, 0xff);
    block.push(0x00);
    block.extend_from_slice(message);
    Ok(block)
}

/// RSA signer holding a private key and the matching device-format public key.
pub struct RsaSigner {
    key: RsaPrivateKey,
    public_key: Vec<u8>,
}

impl RsaSigner {
    /// Creates a signer from a private key and its encoded public key.
    ///
    /// Fails with [`AdbError::InvalidKey`] when the modulus cannot hold a
    /// padded SHA-1 DigestInfo and token.
    pub fn new(key: RsaPrivateKey, public_key: Vec<u8>) -> Result<Self> {
        let needed = SHA1_DIGEST_INFO.len() + TOKEN_SIZE + PADDING_OVERHEAD;
        if key.size() < needed {
            return Err(AdbError::InvalidKey(format!(
                "{}-bit modulus is too small to sign a token, need at least {} bits",
                key.n().bits(),
                needed * 8
            )));
        }
        Ok(Self { key, public_key })
    }

    /// Modulus length in bytes; every signature has exactly this length.
    pub fn modulus_len(&self) -> usize {
        self.key.size()
    }

    /// The private key.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }
}

impl AuthSigner for RsaSigner {
    fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(SHA1_DIGEST_INFO.len() + token.len());
        data.extend_from_slice(&SHA1_DIGEST_INFO);
        data.extend_from_slice(token);

        let k = self.modulus_len();
        let block = pad_for_signing(&data, k)?;

        let m = BigUint::from_bytes_be(&block);
        let s = m.modpow(self.key.d(), self.key.n());

        let raw = s.to_bytes_be();
        let mut signature = vec![0u8; k - raw.len()];
        signature.extend_from_slice(&raw);
        Ok(signature)
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }
}

impl std::fmt::Debug for RsaSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaSigner")
            .field("modulus_bits", &self.key.n().bits())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}
