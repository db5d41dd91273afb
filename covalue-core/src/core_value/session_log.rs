/*
    session_log.rs - One writer's append-only transaction log

    Every session keeps:
    - the transactions, in append order
    - a streaming BLAKE3 hash over the value id, session id and every
      transaction so far
    - the signature over the hash after the last transaction
    - signatures at chunk boundaries, recorded whenever the transactions
      accumulated since the previous boundary exceed MAX_RECOMMENDED_TX_SIZE

    Chunks sent to peers never span a boundary, so each piece can be
    verified on its own with the boundary signature that closes it.
*/

use super::errors::{CoValueError, CoValueResult};
use super::ids::{CoValueId, SessionId};
use super::transaction::Transaction;
use crate::crypto::Signature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Accumulated transaction size after which a boundary signature is kept
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// A verifiable run of transactions following `after` existing ones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: usize,
    pub new_transactions: Vec<Transaction>,
    pub last_signature: Signature,
}

/// Split `transactions[from..]` into pieces that end at recorded boundaries
///
/// Boundary `i` in `signature_after` means a signature exists for the
/// prefix ending at index `i` (inclusive).
pub fn split_into_pieces(
    transactions: &[Transaction],
    from: usize,
    signature_after: &BTreeMap<usize, Signature>,
    last_signature: Option<&Signature>,
) -> Vec<SessionNewContent> {
    let mut pieces = Vec::new();
    let mut start = from;

    for (&idx, signature) in signature_after.range(from..) {
        if idx >= transactions.len() {
            break;
        }
        pieces.push(SessionNewContent {
            after: start,
            new_transactions: transactions[start..=idx].to_vec(),
            last_signature: signature.clone(),
        });
        start = idx + 1;
    }

    if start < transactions.len() {
        if let Some(signature) = last_signature {
            pieces.push(SessionNewContent {
                after: start,
                new_transactions: transactions[start..].to_vec(),
                last_signature: signature.clone(),
            });
        }
    }

    pieces
}

/// Hash chain of a session, seeded with the value and session ids
#[derive(Debug, Clone)]
pub struct StreamingHash {
    hasher: blake3::Hasher,
}

impl StreamingHash {
    pub fn new(id: &CoValueId, session: &SessionId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(id.as_str().as_bytes());
        hasher.update(b"/");
        hasher.update(session.as_str().as_bytes());
        StreamingHash { hasher }
    }

    pub fn update(&mut self, tx: &Transaction) -> CoValueResult<()> {
        let encoded =
            serde_json::to_vec(tx).map_err(|e| CoValueError::Serialization(e.to_string()))?;
        self.hasher.update(&(encoded.len() as u64).to_le_bytes());
        self.hasher.update(&encoded);
        Ok(())
    }

    /// Message that signatures are made over
    pub fn digest(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    hash: StreamingHash,
    last_signature: Option<Signature>,
    signature_after: BTreeMap<usize, Signature>,
    size_since_boundary: usize,
}

impl SessionLog {
    pub fn new(id: &CoValueId, session: &SessionId) -> Self {
        SessionLog {
            transactions: Vec::new(),
            hash: StreamingHash::new(id, session),
            last_signature: None,
            signature_after: BTreeMap::new(),
            size_since_boundary: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    pub fn signature_after(&self) -> &BTreeMap<usize, Signature> {
        &self.signature_after
    }

    /// Hash state after appending `new` on top of the current log
    pub fn hash_with(&self, new: &[Transaction]) -> CoValueResult<StreamingHash> {
        let mut hash = self.hash.clone();
        for tx in new {
            hash.update(tx)?;
        }
        Ok(hash)
    }

    /// Append transactions whose signature has already been checked
    /// against `hash`
    pub fn append_verified(&mut self, new: Vec<Transaction>, hash: StreamingHash, signature: Signature) {
        self.size_since_boundary += new.iter().map(Transaction::encoded_size).sum::<usize>();
        self.transactions.extend(new);
        self.hash = hash;

        if self.size_since_boundary > MAX_RECOMMENDED_TX_SIZE {
            self.signature_after
                .insert(self.transactions.len() - 1, signature.clone());
            self.size_since_boundary = 0;
        }
        self.last_signature = Some(signature);
    }

    /// Verifiable pieces covering everything after `from`
    pub fn pieces_since(&self, from: usize) -> Vec<SessionNewContent> {
        split_into_pieces(
            &self.transactions,
            from,
            &self.signature_after,
            self.last_signature.as_ref(),
        )
    }
}
