/*
    core.rs - Transaction log of one collaborative value

    CoValueCore owns the header and one SessionLog per writer. It is the
    only place transactions enter a value:

    - make_transaction   local append into a session the signer owns
    - try_add_transactions
                         verified append of a remote chunk; the whole
                         chunk is rejected on any failure
    - new_content_since  verifiable pieces a peer is missing

    Permission checks and decryption are layered on top by the node; the
    core only enforces ordering and signatures.
*/

use super::errors::{CoValueError, CoValueResult};
use super::header::Header;
use super::ids::{AgentId, CoValueId, SessionId, TransactionId};
use super::known_state::KnownState;
use super::session_log::{SessionLog, SessionNewContent};
use super::transaction::{Privacy, Transaction};
use crate::crypto::{AgentSecret, CryptoProvider, KeyId, KeySecret, Signature};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Content of one value a peer is missing
///
/// Carries the header when the peer does not have it yet, and for each
/// session one verifiable piece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContent {
    pub id: CoValueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Header>,
    pub new: BTreeMap<SessionId, SessionNewContent>,
}

impl NewContent {
    /// Known state implied by the sender having sent this content
    pub fn implied_known_state(&self) -> KnownState {
        let mut known = KnownState::empty(self.id.clone());
        known.header = self.header.is_some();
        for (session, piece) in &self.new {
            known.set(session.clone(), piece.after + piece.new_transactions.len());
        }
        known
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }
}

/// Assemble per-session pieces into messages
///
/// Message `i` carries piece `i` of every session that has one, so pieces
/// of a session arrive in order and the header rides on the first message.
pub fn assemble_content(
    id: &CoValueId,
    header: Option<&Header>,
    pieces: BTreeMap<SessionId, Vec<SessionNewContent>>,
) -> Vec<NewContent> {
    let mut remaining: BTreeMap<SessionId, std::vec::IntoIter<SessionNewContent>> = pieces
        .into_iter()
        .map(|(session, session_pieces)| (session, session_pieces.into_iter()))
        .collect();

    let mut messages = Vec::new();
    loop {
        let new: BTreeMap<SessionId, SessionNewContent> = remaining
            .iter_mut()
            .filter_map(|(session, iter)| iter.next().map(|piece| (session.clone(), piece)))
            .collect();

        let first = messages.is_empty();
        if new.is_empty() && !(first && header.is_some()) {
            break;
        }
        messages.push(NewContent {
            id: id.clone(),
            header: if first { header.cloned() } else { None },
            new,
        });
    }

    messages
}

/// Nonce material binding a private transaction to its position
pub fn nonce_material(id: &CoValueId, tx_id: &TransactionId) -> Vec<u8> {
    format!("{}/{}/{}", id, tx_id.session_id, tx_id.tx_index).into_bytes()
}

#[derive(Debug, Clone)]
pub struct CoValueCore {
    id: CoValueId,
    header: Header,
    sessions: BTreeMap<SessionId, SessionLog>,
    crypto: Arc<dyn CryptoProvider>,
}

impl CoValueCore {
    /// New empty value; the id is derived from the header
    pub fn create(header: Header, crypto: Arc<dyn CryptoProvider>) -> CoValueResult<Self> {
        let id = header.id()?;
        Ok(CoValueCore {
            id,
            header,
            sessions: BTreeMap::new(),
            crypto,
        })
    }

    /// New empty value from a header received for `id`
    pub fn from_remote_header(
        id: &CoValueId,
        header: Header,
        crypto: Arc<dyn CryptoProvider>,
    ) -> CoValueResult<Self> {
        header.verify_id(id)?;
        Self::create(header, crypto)
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        self.sessions.iter()
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn session_len(&self, session: &SessionId) -> usize {
        self.sessions.get(session).map(SessionLog::len).unwrap_or(0)
    }

    /// All transactions with their ids, in session order
    pub fn transactions(&self) -> impl Iterator<Item = (TransactionId, &Transaction)> {
        self.sessions.iter().flat_map(|(session, log)| {
            log.transactions()
                .iter()
                .enumerate()
                .map(move |(idx, tx)| (TransactionId::new(session.clone(), idx), tx))
        })
    }

    pub fn known_state(&self) -> KnownState {
        let mut known = KnownState::empty(self.id.clone());
        known.header = true;
        for (session, log) in &self.sessions {
            known.set(session.clone(), log.len());
        }
        known
    }

    /// Sign and append a local transaction
    ///
    /// `signer` must be the agent behind the session's actor. Agent sessions
    /// are checked directly; for account sessions the caller resolves the
    /// account's agent and passes it as `expected_agent`.
    #[allow(clippy::too_many_arguments)]
    pub fn make_transaction(
        &mut self,
        session: &SessionId,
        signer: &AgentSecret,
        expected_agent: &AgentId,
        changes: Vec<Value>,
        privacy: Privacy,
        read_key: Option<(&KeyId, &KeySecret)>,
        made_at: u64,
    ) -> CoValueResult<TransactionId> {
        let signer_agent = self.crypto.agent_id(signer);
        if &signer_agent != expected_agent {
            return Err(CoValueError::SessionNotOwned(session.clone()));
        }
        if let Some(owner) = session.actor().as_agent() {
            if owner != &signer_agent {
                return Err(CoValueError::SessionNotOwned(session.clone()));
            }
        }

        let tx_id = TransactionId::new(session.clone(), self.session_len(session));
        let tx = match privacy {
            Privacy::Trusting => Transaction::Trusting { made_at, changes },
            Privacy::Private => {
                let (key_id, key_secret) =
                    read_key.ok_or_else(|| CoValueError::NoReadKey(self.id.clone()))?;
                let plaintext = serde_json::to_vec(&changes)
                    .map_err(|e| CoValueError::Serialization(e.to_string()))?;
                let ciphertext = self.crypto.encrypt(
                    &plaintext,
                    key_secret,
                    &nonce_material(&self.id, &tx_id),
                )?;
                Transaction::Private {
                    made_at,
                    key_used: key_id.clone(),
                    encrypted_changes: hex::encode(ciphertext),
                }
            }
        };

        let log = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionLog::new(&self.id, session));
        let hash = log.hash_with(std::slice::from_ref(&tx))?;
        let signature = self.crypto.sign(signer, &hash.digest());
        log.append_verified(vec![tx], hash, signature);

        trace!(co_value = %self.id, session = %session, idx = tx_id.tx_index, "local transaction");
        Ok(tx_id)
    }

    /// Verify and append a remote chunk
    ///
    /// Returns how many transactions were added. A chunk entirely already
    /// held is a no-op; one that starts past the local end or only partly
    /// overlaps is `OutOfOrder`. `signers` lists the agents allowed to have
    /// signed for the session's actor.
    pub fn try_add_transactions(
        &mut self,
        session: &SessionId,
        after: usize,
        new_transactions: &[Transaction],
        signature: &Signature,
        signers: &[AgentId],
    ) -> CoValueResult<usize> {
        let have = self.session_len(session);

        if after + new_transactions.len() <= have {
            debug!(co_value = %self.id, session = %session, "chunk already held");
            return Ok(0);
        }
        if after != have {
            return Err(CoValueError::OutOfOrder {
                session: session.clone(),
                expected: have,
                got: after,
            });
        }

        let hash = match self.sessions.get(session) {
            Some(log) => log.hash_with(new_transactions)?,
            None => SessionLog::new(&self.id, session).hash_with(new_transactions)?,
        };
        let digest = hash.digest();

        let mut verified = false;
        for agent in signers {
            if self.crypto.verify(agent, &digest, signature)? {
                verified = true;
                break;
            }
        }
        if !verified {
            return Err(CoValueError::Integrity {
                session: session.clone(),
                reason: if signers.is_empty() {
                    "no known signer for session actor".to_string()
                } else {
                    "signature does not match streaming hash".to_string()
                },
            });
        }

        let log = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionLog::new(&self.id, session));
        log.append_verified(new_transactions.to_vec(), hash, signature.clone());

        metrics::counter!("covalue_transactions_applied_total").increment(new_transactions.len() as u64);
        Ok(new_transactions.len())
    }

    /// Pieces a peer at `known` is missing; everything when `known` is None
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Vec<NewContent> {
        let send_header = !known.map(|k| k.header).unwrap_or(false);

        let mut pieces = BTreeMap::new();
        for (session, log) in &self.sessions {
            let from = known.map(|k| k.get(session)).unwrap_or(0);
            let session_pieces = log.pieces_since(from);
            if !session_pieces.is_empty() {
                pieces.insert(session.clone(), session_pieces);
            }
        }

        assemble_content(&self.id, send_header.then_some(&self.header), pieces)
    }

    /// Decrypt a private transaction's changes
    pub fn decrypt_changes(
        &self,
        tx_id: &TransactionId,
        encrypted_changes: &str,
        key: &KeySecret,
    ) -> CoValueResult<Vec<Value>> {
        let ciphertext = hex::decode(encrypted_changes)
            .map_err(|e| CoValueError::Serialization(e.to_string()))?;
        let plaintext = self
            .crypto
            .decrypt(&ciphertext, key, &nonce_material(&self.id, tx_id))?;
        serde_json::from_slice(&plaintext).map_err(|e| CoValueError::Serialization(e.to_string()))
    }
}
