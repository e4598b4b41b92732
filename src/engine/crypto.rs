//! Config transport: RSA-OAEP for small payloads, RSA + AES-256-GCM for the rest.
//!
//! Wire forms:
//! - direct: `base64(rsa_oaep_sha256(json))`
//! - hybrid: `hybrid:` + `base64(rsa(aes_key) || nonce || aes_gcm(json))`
//! - plain:  the JSON itself, only when no public key is available

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use sha2::Sha256;
use zeroize::Zeroize;

use super::types::ConfigPayload;
use crate::error::AppError;

pub const HYBRID_PREFIX: &str = "hybrid:";
/// Shortest string the decoder treats as ciphertext when no prefix is present.
pub const MIN_ENCRYPTED_LEN: usize = 200;
pub const AES_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
/// Output size of SHA-256, used by the OAEP overhead calculation.
const OAEP_HASH_LEN: usize = 32;
pub const MIN_RSA_BITS: usize = 2048;

/// Error type for crypto operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Key management error: {0}")]
    KeyManagement(String),
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyManagement(msg) => AppError::Internal(msg),
            other => AppError::Decode(other.to_string()),
        }
    }
}

/// Which path a transport string took. Plain is a distinct tag so callers
/// can tell a downgrade apart from a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportEncoding {
    Direct,
    Hybrid,
    Plain,
}

#[derive(Debug, Clone)]
pub struct EncodedConfig {
    pub encoding: TransportEncoding,
    pub payload: String,
}

/// Largest plaintext RSA-OAEP-SHA256 can encrypt in one block with `key`.
pub fn direct_capacity(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(2 * OAEP_HASH_LEN + 2)
}

// ---------------------------------------------------------------------------
// Encoding (widget side)
// ---------------------------------------------------------------------------

/// Serialize and encrypt `config` for transport.
///
/// Without a public key the payload goes out as plain JSON, tagged
/// `TransportEncoding::Plain`.
pub fn encode(
    config: &ConfigPayload,
    public_key: Option<&RsaPublicKey>,
) -> Result<EncodedConfig, CryptoError> {
    let serialized =
        serde_json::to_string(config).map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let Some(key) = public_key else {
        tracing::warn!("No public key available, sending config without encryption");
        return Ok(EncodedConfig {
            encoding: TransportEncoding::Plain,
            payload: serialized,
        });
    };

    if serialized.len() <= direct_capacity(key) {
        let ciphertext = key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), serialized.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        return Ok(EncodedConfig {
            encoding: TransportEncoding::Direct,
            payload: B64.encode(ciphertext),
        });
    }

    let mut aes_key = [0u8; AES_KEY_LEN];
    OsRng.fill_bytes(&mut aes_key);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aes_key));
    let sealed = cipher.encrypt(Nonce::from_slice(&nonce_bytes), serialized.as_bytes());
    let wrapped_key = key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), &aes_key);
    aes_key.zeroize();

    let sealed = sealed.map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let wrapped_key = wrapped_key.map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let mut blob = Vec::with_capacity(wrapped_key.len() + NONCE_LEN + sealed.len());
    blob.extend_from_slice(&wrapped_key);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&sealed);

    Ok(EncodedConfig {
        encoding: TransportEncoding::Hybrid,
        payload: format!("{}{}", HYBRID_PREFIX, B64.encode(blob)),
    })
}

/// Heuristic for an unprefixed transport string: long and base64-only.
pub fn looks_encrypted(s: &str) -> bool {
    s.len() >= MIN_ENCRYPTED_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

// ---------------------------------------------------------------------------
// Key holder (server side)
// ---------------------------------------------------------------------------

/// Public key plus the algorithm metadata a client needs to call `encode`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyInfo {
    pub public_key: String,
    pub algorithm: &'static str,
    pub hash: &'static str,
    pub modulus_bits: usize,
    pub direct_capacity: usize,
    pub hybrid: HybridInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridInfo {
    pub cipher: &'static str,
    pub key_bytes: usize,
    pub nonce_bytes: usize,
    pub prefix: &'static str,
}

/// Process-scoped RSA keypair. Generated once at startup and held in memory
/// only; the private key is zeroized when the holder is dropped.
#[derive(Clone)]
pub struct ConfigCipher {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl ConfigCipher {
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_RSA_BITS {
            return Err(CryptoError::KeyManagement(format!(
                "RSA key size {} is below the minimum of {}",
                bits, MIN_RSA_BITS
            )));
        }
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyManagement(format!("RSA key generation failed: {}", e)))?;
        Ok(Self::from_private_key(private_key))
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyManagement(format!("PEM export failed: {}", e)))
    }

    pub fn public_key_info(&self) -> Result<PublicKeyInfo, CryptoError> {
        Ok(PublicKeyInfo {
            public_key: self.public_key_pem()?,
            algorithm: "RSA-OAEP",
            hash: "SHA-256",
            modulus_bits: self.public_key.size() * 8,
            direct_capacity: direct_capacity(&self.public_key),
            hybrid: HybridInfo {
                cipher: "AES-256-GCM",
                key_bytes: AES_KEY_LEN,
                nonce_bytes: NONCE_LEN,
                prefix: HYBRID_PREFIX,
            },
        })
    }

    /// Decode a transport string back into a config. The encoding is
    /// detected from the `hybrid:` prefix, then the length/charset heuristic.
    pub fn decode(&self, transport: &str) -> Result<(ConfigPayload, TransportEncoding), CryptoError> {
        let transport = transport.trim();
        if transport.is_empty() {
            return Err(CryptoError::Malformed("empty config payload".into()));
        }

        let (plaintext, encoding) = if let Some(body) = transport.strip_prefix(HYBRID_PREFIX) {
            (self.decrypt_hybrid(body)?, TransportEncoding::Hybrid)
        } else if looks_encrypted(transport) {
            (self.decrypt_direct(transport)?, TransportEncoding::Direct)
        } else {
            (transport.as_bytes().to_vec(), TransportEncoding::Plain)
        };

        let config: ConfigPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::Malformed(format!("config is not valid JSON: {}", e)))?;
        Ok((config, encoding))
    }

    fn decrypt_direct(&self, body: &str) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = B64.decode(body)?;
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    fn decrypt_hybrid(&self, body: &str) -> Result<Vec<u8>, CryptoError> {
        let blob = B64.decode(body)?;
        let rsa_len = self.public_key.size();
        if blob.len() <= rsa_len + NONCE_LEN {
            return Err(CryptoError::Malformed(format!(
                "hybrid payload too short: {} bytes",
                blob.len()
            )));
        }

        let (wrapped_key, rest) = blob.split_at(rsa_len);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);

        let mut aes_key = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped_key)
            .map_err(|e| CryptoError::Decrypt(format!("symmetric key: {}", e)))?;
        if aes_key.len() != AES_KEY_LEN {
            aes_key.zeroize();
            return Err(CryptoError::Decrypt(format!(
                "symmetric key has wrong length: {} (expected {})",
                aes_key.len(),
                AES_KEY_LEN
            )));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aes_key));
        aes_key.zeroize();
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|e| CryptoError::Decrypt(format!("payload: {}", e)))
    }
}

/// Parse a PEM public key as served by `/api/public-key`.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| CryptoError::KeyManagement(format!("invalid public key: {}", e)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
