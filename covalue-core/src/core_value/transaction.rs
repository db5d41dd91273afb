/*
    transaction.rs - Signed units of change

    A transaction is either trusting (changes in plaintext JSON) or private
    (changes encrypted with a read key, nonce bound to value, session and
    index). Readers see both through DecryptedTransaction once permission
    checks and decryption have run.
*/

use super::ids::TransactionId;
use crate::crypto::KeyId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Privacy {
    Trusting,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    #[serde(rename_all = "camelCase")]
    Trusting { made_at: u64, changes: Vec<Value> },
    #[serde(rename_all = "camelCase")]
    Private {
        made_at: u64,
        key_used: KeyId,
        /// Hex of the ciphertext of the JSON change array
        encrypted_changes: String,
    },
}

impl Transaction {
    /// Milliseconds since the Unix epoch, as claimed by the author
    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => *made_at,
        }
    }

    pub fn privacy(&self) -> Privacy {
        match self {
            Transaction::Trusting { .. } => Privacy::Trusting,
            Transaction::Private { .. } => Privacy::Private,
        }
    }

    /// Approximate wire size used for signature chunking
    pub fn encoded_size(&self) -> usize {
        match self {
            Transaction::Trusting { changes, .. } => changes
                .iter()
                .map(|c| serde_json::to_string(c).map(|s| s.len()).unwrap_or(0))
                .sum(),
            Transaction::Private {
                encrypted_changes, ..
            } => encrypted_changes.len(),
        }
    }

    /// Trusting changes, if any
    pub fn trusting_changes(&self) -> Option<&[Value]> {
        match self {
            Transaction::Trusting { changes, .. } => Some(changes),
            Transaction::Private { .. } => None,
        }
    }
}

/// A valid transaction whose changes are readable
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedTransaction {
    pub tx_id: TransactionId,
    pub made_at: u64,
    pub changes: Vec<Value>,
}

impl DecryptedTransaction {
    /// Canonical replay key: `made_at`, then session, then index
    pub fn order_key(&self) -> (u64, &TransactionId) {
        (self.made_at, &self.tx_id)
    }
}

/// Sort into canonical replay order
pub fn sort_canonical(transactions: &mut [DecryptedTransaction]) {
    transactions.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
}
