//! Production provider backed by the dalek curve crates
//!
//! - Ed25519 (`ed25519-dalek`) for transaction signatures
//! - X25519 (`x25519-dalek`) ephemeral-static sealed boxes for key reveals
//! - XChaCha20-Poly1305 for private transactions and sealed payloads
//! - BLAKE3 for nonce and key derivation

use super::provider::{
    AgentSecret, CryptoError, CryptoProvider, CryptoResult, KeyId, KeySecret, Signature,
};
use crate::core_value::ids::AgentId;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

const SEAL_CONTEXT: &str = "covalue 2024 sealed box key";
const NONCE_CONTEXT: &str = "covalue 2024 transaction nonce";

/// Default [`CryptoProvider`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DalekCrypto;

impl DalekCrypto {
    pub fn new() -> Self {
        DalekCrypto
    }

    fn cipher(key: &[u8; 32]) -> CryptoResult<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    fn nonce(nonce_material: &[u8]) -> [u8; 24] {
        let derived = blake3::derive_key(NONCE_CONTEXT, nonce_material);
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&derived[..24]);
        nonce
    }

    fn seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
        let mut material = [0u8; 96];
        material[..32].copy_from_slice(shared);
        material[32..64].copy_from_slice(ephemeral);
        material[64..].copy_from_slice(recipient);
        let key = blake3::derive_key(SEAL_CONTEXT, &material);
        material.zeroize();
        key
    }
}

impl CryptoProvider for DalekCrypto {
    fn new_agent_secret(&self) -> AgentSecret {
        AgentSecret::from_bytes(rand::random(), rand::random())
    }

    fn agent_id(&self, secret: &AgentSecret) -> AgentId {
        let signer = SigningKey::from_bytes(secret.signer_seed()).verifying_key();
        let sealer = X25519PublicKey::from(&StaticSecret::from(*secret.sealer_secret()));
        AgentId::from_public_keys(sealer.as_bytes(), signer.as_bytes())
    }

    fn sign(&self, secret: &AgentSecret, message: &[u8]) -> Signature {
        let signing_key = SigningKey::from_bytes(secret.signer_seed());
        Signature::from_bytes(&signing_key.sign(message).to_bytes())
    }

    fn verify(&self, agent: &AgentId, message: &[u8], signature: &Signature) -> CryptoResult<bool> {
        let public = agent
            .signer_public()
            .ok_or_else(|| CryptoError::InvalidKey(format!("malformed agent id {}", agent)))?;
        let verifying_key =
            VerifyingKey::from_bytes(&public).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.to_bytes()?);

        Ok(verifying_key.verify(message, &signature).is_ok())
    }

    fn new_read_key(&self) -> (KeyId, KeySecret) {
        let secret: [u8; 32] = rand::random();
        let id = KeyId::from_digest(&blake3::hash(&secret).as_bytes()[..16]);
        (id, KeySecret::from_bytes(secret))
    }

    fn encrypt(&self, plaintext: &[u8], key: &KeySecret, nonce_material: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = Self::nonce(nonce_material);
        Self::cipher(key.as_bytes())?
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8], key: &KeySecret, nonce_material: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = Self::nonce(nonce_material);
        Self::cipher(key.as_bytes())?
            .decrypt(XNonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn seal(&self, plaintext: &[u8], recipient: &AgentId) -> CryptoResult<Vec<u8>> {
        let recipient_public = recipient
            .sealer_public()
            .ok_or_else(|| CryptoError::InvalidKey(format!("malformed agent id {}", recipient)))?;

        let ephemeral = StaticSecret::from(rand::random::<[u8; 32]>());
        let ephemeral_public = X25519PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(recipient_public));

        let mut key = Self::seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), &recipient_public);
        let sealed = Self::cipher(&key)?
            .encrypt(XNonce::from_slice(&[0u8; 24]), plaintext)
            .map_err(|e| CryptoError::Encoding(e.to_string()));
        key.zeroize();

        let mut out = ephemeral_public.as_bytes().to_vec();
        out.extend_from_slice(&sealed?);
        Ok(out)
    }

    fn unseal(&self, sealed: &[u8], recipient: &AgentSecret) -> CryptoResult<Vec<u8>> {
        if sealed.len() < 32 {
            return Err(CryptoError::DecryptionFailed);
        }
        let (ephemeral_bytes, ciphertext) = sealed.split_at(32);
        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(ephemeral_bytes);

        let secret = StaticSecret::from(*recipient.sealer_secret());
        let recipient_public = X25519PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&X25519PublicKey::from(ephemeral));

        let mut key = Self::seal_key(shared.as_bytes(), &ephemeral, recipient_public.as_bytes());
        let opened = Self::cipher(&key)?
            .decrypt(XNonce::from_slice(&[0u8; 24]), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed);
        key.zeroize();
        opened
    }

    fn random_salt(&self) -> String {
        bs58::encode(rand::random::<[u8; 8]>()).into_string()
    }
}
