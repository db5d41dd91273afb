//! Cryptographic primitives used by the transaction log
//!
//! Signing, sealing and symmetric encryption sit behind the
//! [`CryptoProvider`] trait so the rest of the crate never touches key
//! bytes directly. [`DalekCrypto`] is the production implementation
//! (Ed25519 signatures, X25519 sealed boxes, XChaCha20-Poly1305, BLAKE3).

mod dalek;
mod provider;

pub use dalek::DalekCrypto;
pub use provider::{
    AgentSecret, CryptoError, CryptoProvider, CryptoResult, KeyId, KeySecret, Signature,
};
