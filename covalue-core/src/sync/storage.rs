//! Storage peers
//!
//! A storage peer is an ordinary peer whose far end is a database instead
//! of another node. It persists three kinds of records:
//!
//! - `CoValueRecord`: value id and header
//! - `SessionRecord`: per session, how many transactions are stored, the
//!   latest signature and the bytes written since the last signature chunk
//! - `TransactionRecord`: one transaction at its session index
//!
//! plus the signature recorded after each chunk, which is enough to
//! rebuild verifiable pieces for any `load`. Storage does not verify
//! signatures; nodes do that when the content comes back.

use super::errors::{SyncError, SyncResult};
use super::message::SyncMessage;
use super::peer::{Peer, PeerId, PeerRole};
use crate::config::StorageConfig;
use crate::core_value::{
    assemble_content, split_into_pieces, CoValueId, Header, KnownState, NewContent, Ruleset,
    SessionId, SessionNewContent, Transaction, MAX_RECOMMENDED_TX_SIZE,
};
use crate::crypto::Signature;
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoValueRecord {
    pub id: CoValueId,
    pub header: Header,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub co_value: CoValueId,
    pub session_id: SessionId,
    /// Number of stored transactions
    pub transaction_count: usize,
    pub last_signature: Signature,
    /// Encoded bytes since the last recorded chunk signature
    pub bytes_since_signature: usize,
}

impl SessionRecord {
    /// Index of the last stored transaction
    pub fn last_index(&self) -> Option<usize> {
        self.transaction_count.checked_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub session_id: SessionId,
    pub index: usize,
    pub transaction: Transaction,
}

/// Persistence behind a storage peer
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_co_value(&self, id: &CoValueId) -> SyncResult<Option<CoValueRecord>>;

    async fn put_co_value(&self, record: CoValueRecord) -> SyncResult<()>;

    async fn get_sessions(&self, id: &CoValueId) -> SyncResult<Vec<SessionRecord>>;

    /// All stored transactions of a session, in index order
    async fn get_transactions(&self, id: &CoValueId, session: &SessionId) -> SyncResult<Vec<Transaction>>;

    /// Chunk signatures by the index they were recorded after
    async fn get_signatures(&self, id: &CoValueId, session: &SessionId) -> SyncResult<BTreeMap<usize, Signature>>;

    /// Store new transactions and the updated session record atomically
    async fn append_session_content(
        &self,
        session: SessionRecord,
        transactions: Vec<TransactionRecord>,
        signature_after: Option<(usize, Signature)>,
    ) -> SyncResult<()>;
}

#[derive(Default)]
struct MemoryValue {
    record: Option<CoValueRecord>,
    sessions: BTreeMap<SessionId, SessionRecord>,
    transactions: BTreeMap<SessionId, Vec<Transaction>>,
    signatures: BTreeMap<SessionId, BTreeMap<usize, Signature>>,
}

/// In-memory backend (for tests)
#[derive(Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<CoValueId, MemoryValue>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_co_value(&self, id: &CoValueId) -> SyncResult<Option<CoValueRecord>> {
        let values = self.values.read().await;
        Ok(values.get(id).and_then(|value| value.record.clone()))
    }

    async fn put_co_value(&self, record: CoValueRecord) -> SyncResult<()> {
        let id = record.id.clone();
        let mut values = self.values.write().await;
        values.entry(id).or_default().record = Some(record);
        Ok(())
    }

    async fn get_sessions(&self, id: &CoValueId) -> SyncResult<Vec<SessionRecord>> {
        let values = self.values.read().await;
        Ok(values
            .get(id)
            .map(|value| value.sessions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_transactions(&self, id: &CoValueId, session: &SessionId) -> SyncResult<Vec<Transaction>> {
        let values = self.values.read().await;
        Ok(values
            .get(id)
            .and_then(|value| value.transactions.get(session).cloned())
            .unwrap_or_default())
    }

    async fn get_signatures(&self, id: &CoValueId, session: &SessionId) -> SyncResult<BTreeMap<usize, Signature>> {
        let values = self.values.read().await;
        Ok(values
            .get(id)
            .and_then(|value| value.signatures.get(session).cloned())
            .unwrap_or_default())
    }

    async fn append_session_content(
        &self,
        session: SessionRecord,
        transactions: Vec<TransactionRecord>,
        signature_after: Option<(usize, Signature)>,
    ) -> SyncResult<()> {
        let mut values = self.values.write().await;
        let value = values.entry(session.co_value.clone()).or_default();

        let stored = value.transactions.entry(session.session_id.clone()).or_default();
        for record in transactions {
            if record.index != stored.len() {
                return Err(SyncError::Storage(format!(
                    "transaction {} of {} out of order, have {}",
                    record.index,
                    session.session_id,
                    stored.len()
                )));
            }
            stored.push(record.transaction);
        }
        if let Some((idx, signature)) = signature_after {
            value
                .signatures
                .entry(session.session_id.clone())
                .or_default()
                .insert(idx, signature);
        }
        value.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }
}

/// SQLite backend over an r2d2 connection pool
pub struct SqliteStorage {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

/// Backend described by the storage settings: SQLite when a path is set,
/// memory otherwise
pub fn open_storage(config: &StorageConfig) -> SyncResult<Arc<dyn StorageBackend>> {
    match &config.sqlite_path {
        Some(path) => {
            debug!(path = %path.display(), pool_size = config.pool_size, "opening sqlite storage");
            Ok(Arc::new(SqliteStorage::open(path, config.pool_size)?))
        }
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> SyncResult<Self> {
        Self::with_manager(SqliteConnectionManager::file(path), pool_size)
    }

    /// Private in-memory database; one connection so every query sees it
    pub fn in_memory() -> SyncResult<Self> {
        Self::with_manager(SqliteConnectionManager::memory(), 1)
    }

    fn with_manager(manager: SqliteConnectionManager, pool_size: u32) -> SyncResult<Self> {
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| SyncError::Storage(format!("Failed to create connection pool: {}", e)))?;
        let storage = SqliteStorage { pool: Arc::new(pool) };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> SyncResult<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| SyncError::Storage(format!("Failed to get connection: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS co_values (
                id TEXT PRIMARY KEY,
                header TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                co_value TEXT NOT NULL,
                session_id TEXT NOT NULL,
                transaction_count INTEGER NOT NULL,
                last_signature TEXT NOT NULL,
                bytes_since_signature INTEGER NOT NULL,
                PRIMARY KEY (co_value, session_id)
            );

            CREATE TABLE IF NOT EXISTS transactions (
                co_value TEXT NOT NULL,
                session_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                tx TEXT NOT NULL,
                PRIMARY KEY (co_value, session_id, idx)
            );

            CREATE TABLE IF NOT EXISTS signature_after (
                co_value TEXT NOT NULL,
                session_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                signature TEXT NOT NULL,
                PRIMARY KEY (co_value, session_id, idx)
            );
            "#,
        )
        .map_err(|e| SyncError::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Run `f` on a pooled connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> SyncResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| SyncError::Storage(format!("Failed to get connection: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| SyncError::Storage(format!("Task join error: {}", e)))?
    }
}

fn sql_err(context: &'static str) -> impl Fn(rusqlite::Error) -> SyncError {
    move |e| SyncError::Storage(format!("{}: {}", context, e))
}

fn parse_session(value: String) -> SyncResult<SessionId> {
    SessionId::try_from(value).map_err(|e| SyncError::Storage(format!("Invalid session id: {}", e)))
}

fn parse_signature(value: String) -> SyncResult<Signature> {
    Signature::parse(&value).map_err(|e| SyncError::Storage(format!("Invalid signature: {}", e)))
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn get_co_value(&self, id: &CoValueId) -> SyncResult<Option<CoValueRecord>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let header: Option<String> = conn
                .query_row(
                    "SELECT header FROM co_values WHERE id = ?",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err("Failed to load value"))?;
            match header {
                Some(header) => Ok(Some(CoValueRecord {
                    id,
                    header: serde_json::from_str(&header)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put_co_value(&self, record: CoValueRecord) -> SyncResult<()> {
        self.with_conn(move |conn| {
            let header = serde_json::to_string(&record.header)?;
            conn.execute(
                "INSERT OR IGNORE INTO co_values (id, header) VALUES (?, ?)",
                params![record.id.as_str(), header],
            )
            .map_err(sql_err("Failed to save value"))?;
            Ok(())
        })
        .await
    }

    async fn get_sessions(&self, id: &CoValueId) -> SyncResult<Vec<SessionRecord>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, transaction_count, last_signature, bytes_since_signature
                     FROM sessions WHERE co_value = ? ORDER BY session_id",
                )
                .map_err(sql_err("Failed to prepare query"))?;
            let rows = stmt
                .query_map(params![id.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(sql_err("Failed to load sessions"))?;

            let mut sessions = Vec::new();
            for row in rows {
                let (session, count, signature, bytes) = row.map_err(sql_err("Failed to read session row"))?;
                sessions.push(SessionRecord {
                    co_value: id.clone(),
                    session_id: parse_session(session)?,
                    transaction_count: count as usize,
                    last_signature: parse_signature(signature)?,
                    bytes_since_signature: bytes as usize,
                });
            }
            Ok(sessions)
        })
        .await
    }

    async fn get_transactions(&self, id: &CoValueId, session: &SessionId) -> SyncResult<Vec<Transaction>> {
        let (id, session) = (id.clone(), session.clone());
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT tx FROM transactions WHERE co_value = ? AND session_id = ? ORDER BY idx")
                .map_err(sql_err("Failed to prepare query"))?;
            let rows = stmt
                .query_map(params![id.as_str(), session.as_str()], |row| row.get::<_, String>(0))
                .map_err(sql_err("Failed to load transactions"))?;

            let mut transactions = Vec::new();
            for row in rows {
                let tx = row.map_err(sql_err("Failed to read transaction row"))?;
                transactions.push(serde_json::from_str(&tx)?);
            }
            Ok(transactions)
        })
        .await
    }

    async fn get_signatures(&self, id: &CoValueId, session: &SessionId) -> SyncResult<BTreeMap<usize, Signature>> {
        let (id, session) = (id.clone(), session.clone());
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT idx, signature FROM signature_after WHERE co_value = ? AND session_id = ?")
                .map_err(sql_err("Failed to prepare query"))?;
            let rows = stmt
                .query_map(params![id.as_str(), session.as_str()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(sql_err("Failed to load signatures"))?;

            let mut signatures = BTreeMap::new();
            for row in rows {
                let (idx, signature) = row.map_err(sql_err("Failed to read signature row"))?;
                signatures.insert(idx as usize, parse_signature(signature)?);
            }
            Ok(signatures)
        })
        .await
    }

    async fn append_session_content(
        &self,
        session: SessionRecord,
        transactions: Vec<TransactionRecord>,
        signature_after: Option<(usize, Signature)>,
    ) -> SyncResult<()> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(sql_err("Failed to begin transaction"))?;

            for record in &transactions {
                tx.execute(
                    "INSERT INTO transactions (co_value, session_id, idx, tx) VALUES (?, ?, ?, ?)",
                    params![
                        session.co_value.as_str(),
                        record.session_id.as_str(),
                        record.index as i64,
                        serde_json::to_string(&record.transaction)?
                    ],
                )
                .map_err(sql_err("Failed to save transaction"))?;
            }

            if let Some((idx, signature)) = &signature_after {
                tx.execute(
                    "INSERT OR REPLACE INTO signature_after (co_value, session_id, idx, signature)
                     VALUES (?, ?, ?, ?)",
                    params![
                        session.co_value.as_str(),
                        session.session_id.as_str(),
                        *idx as i64,
                        signature.as_str()
                    ],
                )
                .map_err(sql_err("Failed to save signature"))?;
            }

            tx.execute(
                r#"
                INSERT INTO sessions (co_value, session_id, transaction_count, last_signature, bytes_since_signature)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(co_value, session_id) DO UPDATE SET
                    transaction_count = excluded.transaction_count,
                    last_signature = excluded.last_signature,
                    bytes_since_signature = excluded.bytes_since_signature
                "#,
                params![
                    session.co_value.as_str(),
                    session.session_id.as_str(),
                    session.transaction_count as i64,
                    session.last_signature.as_str(),
                    session.bytes_since_signature as i64
                ],
            )
            .map_err(sql_err("Failed to save session"))?;

            tx.commit().map_err(sql_err("Failed to commit transaction"))?;
            Ok(())
        })
        .await
    }
}

/// Drives a backend with the sync protocol
pub struct StoragePeer {
    backend: Arc<dyn StorageBackend>,
    outgoing: mpsc::UnboundedSender<SyncMessage>,
}

impl StoragePeer {
    /// Start serving `backend`; returns the peer to hand to a node
    pub fn spawn(name: &str, backend: Arc<dyn StorageBackend>) -> Peer {
        let (to_node, from_storage) = mpsc::unbounded_channel();
        let (to_storage, mut from_node) = mpsc::unbounded_channel::<SyncMessage>();

        let storage = StoragePeer {
            backend,
            outgoing: to_node,
        };
        tokio::spawn(async move {
            while let Some(msg) = from_node.recv().await {
                if let Err(e) = storage.handle_message(msg).await {
                    warn!(error = %e, "storage peer failed to handle message");
                }
            }
            debug!("storage peer stopped");
        });

        Peer::new(PeerId::new(name), PeerRole::Storage, from_storage, to_storage)
    }

    fn send(&self, msg: SyncMessage) -> SyncResult<()> {
        self.outgoing
            .send(msg)
            .map_err(|_| SyncError::PeerClosed("storage".to_string()))
    }

    async fn handle_message(&self, msg: SyncMessage) -> SyncResult<()> {
        match msg {
            SyncMessage::Load(known) => self.handle_load(known).await,
            SyncMessage::Content(content) => self.handle_content(content).await,
            SyncMessage::Known { .. } | SyncMessage::Done { .. } => Ok(()),
        }
    }

    async fn known_state(&self, id: &CoValueId) -> SyncResult<KnownState> {
        let mut known = KnownState::empty(id.clone());
        known.header = self.backend.get_co_value(id).await?.is_some();
        for session in self.backend.get_sessions(id).await? {
            known.set(session.session_id, session.transaction_count);
        }
        Ok(known)
    }

    async fn handle_load(&self, their: KnownState) -> SyncResult<()> {
        let id = their.id.clone();
        let Some(record) = self.backend.get_co_value(&id).await? else {
            debug!(co_value = %id, "not in storage");
            return self.send(SyncMessage::known(KnownState::empty(id)));
        };

        let mut visited = HashSet::from([id.clone()]);
        self.send_dependencies(&record, &mut visited).await?;

        self.send(SyncMessage::known(self.known_state(&id).await?))?;
        for content in self.content_since(&record, &their).await? {
            self.send(SyncMessage::Content(content))?;
        }
        self.send(SyncMessage::Done { id })
    }

    /// Values a node must hold before it can verify `record`
    async fn dependencies(&self, record: &CoValueRecord) -> SyncResult<Vec<CoValueId>> {
        let mut deps = BTreeSet::new();
        match &record.header.ruleset {
            Ruleset::OwnedByGroup { group } => {
                deps.insert(group.clone());
            }
            Ruleset::Group { initial_admin } => {
                if let Some(account) = initial_admin.as_account() {
                    deps.insert(account.clone());
                }
            }
            Ruleset::UnsafeAllowAll => {}
        }
        for session in self.backend.get_sessions(&record.id).await? {
            if let Some(account) = session.session_id.actor().as_account() {
                deps.insert(account.clone());
            }
        }
        deps.remove(&record.id);
        Ok(deps.into_iter().collect())
    }

    /// Full content of every stored dependency, deepest first
    fn send_dependencies<'a>(
        &'a self,
        record: &'a CoValueRecord,
        visited: &'a mut HashSet<CoValueId>,
    ) -> Pin<Box<dyn Future<Output = SyncResult<()>> + Send + 'a>> {
        Box::pin(async move {
            for dep in self.dependencies(record).await? {
                if !visited.insert(dep.clone()) {
                    continue;
                }
                let Some(dep_record) = self.backend.get_co_value(&dep).await? else {
                    continue;
                };
                self.send_dependencies(&dep_record, visited).await?;
                let nothing = KnownState::empty(dep.clone());
                for content in self.content_since(&dep_record, &nothing).await? {
                    self.send(SyncMessage::Content(content))?;
                }
            }
            Ok(())
        })
    }

    async fn content_since(&self, record: &CoValueRecord, their: &KnownState) -> SyncResult<Vec<NewContent>> {
        let mut pieces: BTreeMap<SessionId, Vec<SessionNewContent>> = BTreeMap::new();
        for session in self.backend.get_sessions(&record.id).await? {
            let from = their.get(&session.session_id);
            if session.transaction_count <= from {
                continue;
            }
            let transactions = self.backend.get_transactions(&record.id, &session.session_id).await?;
            let signatures = self.backend.get_signatures(&record.id, &session.session_id).await?;
            let session_pieces = split_into_pieces(&transactions, from, &signatures, Some(&session.last_signature));
            if !session_pieces.is_empty() {
                pieces.insert(session.session_id, session_pieces);
            }
        }
        let header = (!their.header).then_some(&record.header);
        Ok(assemble_content(&record.id, header, pieces))
    }

    async fn handle_content(&self, content: NewContent) -> SyncResult<()> {
        let id = content.id.clone();

        if self.backend.get_co_value(&id).await?.is_none() {
            match content.header {
                Some(header) => {
                    if let Err(e) = header.verify_id(&id) {
                        warn!(co_value = %id, error = %e, "refusing to store mismatched header");
                        metrics::counter!("covalue_integrity_failures_total").increment(1);
                        return Ok(());
                    }
                    self.backend
                        .put_co_value(CoValueRecord {
                            id: id.clone(),
                            header,
                        })
                        .await?
                }
                None => {
                    return self.send(SyncMessage::correction(KnownState::empty(id)));
                }
            }
        }

        let mut sessions: HashMap<SessionId, SessionRecord> = self
            .backend
            .get_sessions(&id)
            .await?
            .into_iter()
            .map(|record| (record.session_id.clone(), record))
            .collect();

        let mut needs_correction = false;
        for (session_id, piece) in content.new {
            let have = sessions.get(&session_id).map(|s| s.transaction_count).unwrap_or(0);
            let count = piece.new_transactions.len();

            if piece.after + count <= have {
                continue;
            }
            if piece.after != have {
                debug!(co_value = %id, session = %session_id, expected = have, got = piece.after, "gap in stored session");
                needs_correction = true;
                continue;
            }

            let mut bytes = sessions
                .get(&session_id)
                .map(|s| s.bytes_since_signature)
                .unwrap_or(0);
            for tx in &piece.new_transactions {
                bytes += tx.encoded_size();
            }
            let last_idx = have + count - 1;
            let signature_after = if bytes > MAX_RECOMMENDED_TX_SIZE {
                bytes = 0;
                Some((last_idx, piece.last_signature.clone()))
            } else {
                None
            };

            let record = SessionRecord {
                co_value: id.clone(),
                session_id: session_id.clone(),
                transaction_count: have + count,
                last_signature: piece.last_signature,
                bytes_since_signature: bytes,
            };
            let transactions = piece
                .new_transactions
                .into_iter()
                .enumerate()
                .map(|(offset, transaction)| TransactionRecord {
                    session_id: session_id.clone(),
                    index: have + offset,
                    transaction,
                })
                .collect();
            self.backend
                .append_session_content(record.clone(), transactions, signature_after)
                .await?;
            sessions.insert(session_id, record);
        }

        let known = self.known_state(&id).await?;
        if needs_correction {
            self.send(SyncMessage::correction(known))
        } else {
            self.send(SyncMessage::known(known))
        }
    }
}
