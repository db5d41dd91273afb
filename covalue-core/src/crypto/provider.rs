//! Provider trait and key material types

use crate::core_value::ids::AgentId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors raised by a crypto provider
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encoding error: {0}")]
    Encoding(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

fn decode_prefixed<const N: usize>(value: &str, prefix: &str) -> CryptoResult<[u8; N]> {
    let encoded = value
        .strip_prefix(prefix)
        .ok_or_else(|| CryptoError::Encoding(format!("expected '{}' prefix", prefix)))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::Encoding(format!("expected {} bytes", N)))
}

/// Secret half of an agent: an Ed25519 signing seed and an X25519 sealing
/// secret. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AgentSecret {
    signer_seed: [u8; 32],
    sealer_secret: [u8; 32],
}

impl AgentSecret {
    const PREFIX: &'static str = "agentSecret_z";

    pub fn from_bytes(signer_seed: [u8; 32], sealer_secret: [u8; 32]) -> Self {
        Self {
            signer_seed,
            sealer_secret,
        }
    }

    pub fn signer_seed(&self) -> &[u8; 32] {
        &self.signer_seed
    }

    pub fn sealer_secret(&self) -> &[u8; 32] {
        &self.sealer_secret
    }

    /// Text form used inside invite links
    pub fn encode(&self) -> String {
        let mut joined = [0u8; 64];
        joined[..32].copy_from_slice(&self.signer_seed);
        joined[32..].copy_from_slice(&self.sealer_secret);
        let encoded = format!("{}{}", Self::PREFIX, bs58::encode(&joined).into_string());
        joined.zeroize();
        encoded
    }

    pub fn decode(value: &str) -> CryptoResult<Self> {
        let mut joined: [u8; 64] = decode_prefixed(value, Self::PREFIX)?;
        let mut signer_seed = [0u8; 32];
        let mut sealer_secret = [0u8; 32];
        signer_seed.copy_from_slice(&joined[..32]);
        sealer_secret.copy_from_slice(&joined[32..]);
        joined.zeroize();
        Ok(Self::from_bytes(signer_seed, sealer_secret))
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentSecret(<redacted>)")
    }
}

/// Identifier of a symmetric read key (`key_z...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub const PREFIX: &'static str = "key_z";

    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(Self::PREFIX)?;
        if rest.is_empty() || rest.contains('_') {
            return None;
        }
        Some(KeyId(value.to_string()))
    }

    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        KeyId(format!("{}{}", Self::PREFIX, bs58::encode(digest).into_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symmetric read key secret. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeySecret([u8; 32]);

impl KeySecret {
    const PREFIX: &'static str = "keySecret_z";

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        KeySecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Text form stored in plaintext reveals (`<keyId>_for_everyone`)
    pub fn encode(&self) -> String {
        format!("{}{}", Self::PREFIX, bs58::encode(&self.0).into_string())
    }

    pub fn decode(value: &str) -> CryptoResult<Self> {
        Ok(KeySecret(decode_prefixed(value, Self::PREFIX)?))
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySecret(<redacted>)")
    }
}

/// Detached Ed25519 signature in text form (`signature_z...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    const PREFIX: &'static str = "signature_z";

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Signature(format!("{}{}", Self::PREFIX, bs58::encode(bytes).into_string()))
    }

    /// Accepts only well-formed signature text
    pub fn parse(value: &str) -> CryptoResult<Self> {
        let signature = Signature(value.to_string());
        signature.to_bytes()?;
        Ok(signature)
    }

    pub fn to_bytes(&self) -> CryptoResult<[u8; 64]> {
        decode_prefixed(&self.0, Self::PREFIX)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cryptographic capabilities the node and sync layers depend on
///
/// Implementations must be deterministic for `verify`, `decrypt` and
/// `agent_id`, since every peer re-derives the same results from the log.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    /// Fresh random agent secret
    fn new_agent_secret(&self) -> AgentSecret;

    /// Public identity of an agent secret
    fn agent_id(&self, secret: &AgentSecret) -> AgentId;

    fn sign(&self, secret: &AgentSecret, message: &[u8]) -> Signature;

    /// `Ok(false)` for a well-formed but wrong signature, `Err` when the
    /// agent id or signature cannot be decoded
    fn verify(&self, agent: &AgentId, message: &[u8], signature: &Signature) -> CryptoResult<bool>;

    /// Fresh symmetric read key
    fn new_read_key(&self) -> (KeyId, KeySecret);

    /// Encrypt with a nonce derived from `nonce_material`
    fn encrypt(&self, plaintext: &[u8], key: &KeySecret, nonce_material: &[u8]) -> CryptoResult<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8], key: &KeySecret, nonce_material: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Anonymous sealed box readable only by `recipient`
    fn seal(&self, plaintext: &[u8], recipient: &AgentId) -> CryptoResult<Vec<u8>>;

    fn unseal(&self, sealed: &[u8], recipient: &AgentSecret) -> CryptoResult<Vec<u8>>;

    /// Random salt for session ids and header uniqueness
    fn random_salt(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_parse() {
        assert!(KeyId::parse("key_z3xAb").is_some());
        assert!(KeyId::parse("key_z").is_none());
        assert!(KeyId::parse("key_zabc_for_everyone").is_none());
        assert!(KeyId::parse("co_zabc").is_none());
    }

    #[test]
    fn test_key_secret_text_form() {
        let secret = KeySecret::from_bytes([7u8; 32]);
        let encoded = secret.encode();
        assert!(encoded.starts_with("keySecret_z"));
        assert_eq!(KeySecret::decode(&encoded).unwrap(), secret);
        assert!(KeySecret::decode("keySecret_zshort").is_err());
    }

    #[test]
    fn test_agent_secret_debug_redacted() {
        let secret = AgentSecret::from_bytes([1u8; 32], [2u8; 32]);
        assert_eq!(format!("{:?}", secret), "AgentSecret(<redacted>)");

        let decoded = AgentSecret::decode(&secret.encode()).unwrap();
        assert_eq!(decoded.signer_seed(), &[1u8; 32]);
        assert_eq!(decoded.sealer_secret(), &[2u8; 32]);
    }

    #[test]
    fn test_signature_rejects_garbage() {
        let sig = Signature("signature_z0OIl".to_string());
        assert!(matches!(sig.to_bytes(), Err(CryptoError::InvalidSignature(_))));
    }
}
