/// Persistent index: UTXO set, claim records, and per-height undo logs
/// (spec.md §6's `Storage` interface).
///
/// `Storage` is a trait so `CatchUp`/`BlockApplier` are testable against an
/// in-memory double; `RocksStorage` is the shipped implementation. Grounded
/// on the teacher's column-family layout in `src/main.rs`
/// (`ColumnFamilyDescriptor`/`COLUMN_FAMILIES`) and its atomic multi-CF
/// commit in `src/atomic_writer.rs` (`AtomicBatchWriter`), which this reuses
/// directly for `batch_write`.
///
/// Per spec.md §1 the authenticated claim trie is out of scope. `get_root_hash`
/// here is a simplified, order-independent digest folded over the live UTXO
/// and claim column families — documented in DESIGN.md as a stand-in for a
/// real Merkle-Patricia trie root, sufficient to satisfy the apply/revert
/// round-trip invariant (spec.md §8) without implementing trie semantics.
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

use crate::atomic_writer::AtomicBatchWriter;
use crate::errors::{ProcResult, StorageError};
use crate::types::HistoryEntry;

pub const CF_UTXO: &str = "utxo";
pub const CF_UTXO_UNDO: &str = "utxo_undo";
pub const CF_CLAIMS: &str = "claims";
pub const CF_CLAIM_UNDO: &str = "claim_undo";
pub const CF_CHAIN_STATE: &str = "chain_state";
pub const CF_HISTORY: &str = "history";

pub const COLUMN_FAMILIES: &[&str] = &[
    CF_UTXO,
    CF_UTXO_UNDO,
    CF_CLAIMS,
    CF_CLAIM_UNDO,
    CF_CHAIN_STATE,
    CF_HISTORY,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    pub address: String,
    pub value: i64,
    pub height: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub claim_id: String,
    pub name: String,
    pub value: Vec<u8>,
    pub height: i32,
    pub address: String,
    pub txid: String,
    pub nout: u32,
    pub amount: i64,
    /// The channel certificate id this claim's value is signed by, if any
    /// (`uri::ClaimDecoder::decode`'s `certificate_id`). `None` for
    /// unsigned claims and for channel claims themselves.
    pub certificate_id: Option<String>,
}

/// A height's worth of reversible UTXO-side effects, matching the original's
/// per-height undo dict of removed/added entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UndoInfo {
    pub spent: Vec<(Vec<u8>, Utxo)>,
    pub created: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UndoClaimInfo {
    pub removed: Vec<(String, ClaimRecord)>,
    pub created: Vec<ClaimRecord>,
}

/// The persistent index this processor depends on (spec.md §6). A single
/// `import_transaction`/`revert_transaction` pair is the unit BlockApplier
/// composes per block; callers are responsible for calling
/// `update_hashes()`/`batch_write()` once per block, not per transaction.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn height(&self) -> ProcResult<i32>;
    async fn last_hash(&self) -> ProcResult<Option<String>>;
    async fn get_root_hash(&self) -> ProcResult<String>;
    async fn save_height(&self, hash: &str, height: i32) -> ProcResult<()>;

    async fn get_history(&self, address: &str) -> ProcResult<Vec<HistoryEntry>>;
    async fn get_balance(&self, address: &str) -> ProcResult<i64>;
    async fn get_proof(&self, address: &str) -> ProcResult<Vec<u8>>;
    async fn listunspent(&self, address: &str) -> ProcResult<Vec<(Vec<u8>, Utxo)>>;
    async fn get_address(&self, outpoint_bytes: &[u8]) -> ProcResult<Option<String>>;
    async fn get_utxo_value(&self, address: &str, outpoint_bytes: &[u8]) -> ProcResult<Option<i64>>;

    /// Applies one transaction's UTXO-side effects, recording the spent
    /// entries and newly-created keys it observed (for later `write_undo_info`).
    async fn import_transaction(
        &self,
        txid: &str,
        height: i32,
        spends: &[(Vec<u8>, String)],
        creates: &[(Vec<u8>, Utxo)],
    ) -> ProcResult<UndoInfo>;

    async fn revert_transaction(&self, undo: &UndoInfo) -> ProcResult<()>;

    async fn import_claim_transaction(
        &self,
        claims: &[ClaimRecord],
    ) -> ProcResult<UndoClaimInfo>;

    async fn revert_claim_transaction(&self, undo: &UndoClaimInfo) -> ProcResult<()>;

    async fn get_undo_info(&self, height: i32) -> ProcResult<Option<UndoInfo>>;
    async fn get_undo_claim_info(&self, height: i32) -> ProcResult<Option<UndoClaimInfo>>;
    async fn write_undo_info(&self, height: i32, undo: &UndoInfo) -> ProcResult<()>;
    async fn write_undo_claim_info(&self, height: i32, undo: &UndoClaimInfo) -> ProcResult<()>;

    /// Recomputes any cached aggregate hash state ahead of `batch_write`.
    async fn update_hashes(&self) -> ProcResult<()>;
    /// Commits everything staged since the last call, atomically.
    async fn batch_write(&self) -> ProcResult<()>;
    async fn close(&self) -> ProcResult<()>;

    async fn get_claim_name(&self, claim_id: &str) -> ProcResult<Option<String>>;
    async fn get_claim_value(&self, claim_id: &str) -> ProcResult<Option<Vec<u8>>>;
    async fn get_claim_height(&self, claim_id: &str) -> ProcResult<Option<i32>>;
    async fn get_claim_address(&self, claim_id: &str) -> ProcResult<Option<String>>;
    async fn get_outpoint_from_claim_id(&self, claim_id: &str) -> ProcResult<Option<(String, u32)>>;
    async fn get_claim_id_from_outpoint(&self, txid: &str, nout: u32) -> ProcResult<Option<String>>;
    async fn get_n_for_name_and_claimid(&self, name: &str, claim_id: &str) -> ProcResult<Option<u32>>;
    async fn get_claimid_for_nth_claim_to_name(&self, name: &str, n: u32) -> ProcResult<Option<String>>;
    async fn get_claims_signed_by(&self, certificate_id: &str) -> ProcResult<Vec<ClaimRecord>>;
}

pub struct RocksStorage {
    db: Arc<DB>,
    pending: tokio::sync::Mutex<AtomicBatchWriter>,
}

impl RocksStorage {
    pub fn open(path: &Path) -> ProcResult<Self> {
        let mut cf_descriptors = vec![ColumnFamilyDescriptor::new("default", Options::default())];
        for cf in COLUMN_FAMILIES {
            cf_descriptors.push(ColumnFamilyDescriptor::new(*cf, Options::default()));
        }
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let db = DB::open_cf_descriptors(&options, path, cf_descriptors)
            .map_err(|e| StorageError::new(format!("opening rocksdb at {:?}: {}", path, e)))?;
        let db = Arc::new(db);
        Ok(RocksStorage {
            pending: tokio::sync::Mutex::new(AtomicBatchWriter::new(db.clone(), 10_000)),
            db,
        })
    }

    async fn get_bytes(&self, cf: &str, key: Vec<u8>) -> ProcResult<Option<Vec<u8>>> {
        let db = self.db.clone();
        let cf = cf.to_string();
        tokio::task::spawn_blocking(move || {
            let handle = db
                .cf_handle(&cf)
                .ok_or_else(|| StorageError::new(format!("missing column family {}", cf)))?;
            db.get_cf(&handle, key)
                .map_err(|e| StorageError::new(e.to_string()))
        })
        .await
        .map_err(|e| StorageError::new(format!("join error: {}", e)))?
    }
}

fn key_string(prefix: &str, suffix: &str) -> Vec<u8> {
    format!("{}:{}", prefix, suffix).into_bytes()
}

#[async_trait]
impl Storage for RocksStorage {
    async fn height(&self) -> ProcResult<i32> {
        match self.get_bytes(CF_CHAIN_STATE, b"height".to_vec()).await? {
            Some(bytes) => Ok(i32::from_le_bytes(
                bytes
                    .try_into()
                    .map_err(|_| StorageError::new("corrupt height record"))?,
            )),
            None => Ok(-1),
        }
    }

    async fn last_hash(&self) -> ProcResult<Option<String>> {
        let bytes = self.get_bytes(CF_CHAIN_STATE, b"last_hash".to_vec()).await?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Folds SHA256 of every UTXO/claim key+value with XOR, which is
    /// order-independent (insertion order during catch-up is not stable
    /// under a forward-then-revert-then-reforward sequence).
    async fn get_root_hash(&self) -> ProcResult<String> {
        let db = self.db.clone();
        let digest = tokio::task::spawn_blocking(move || -> Result<[u8; 32], StorageError> {
            let mut acc = [0u8; 32];
            for cf_name in [CF_UTXO, CF_CLAIMS] {
                let cf = db
                    .cf_handle(cf_name)
                    .ok_or_else(|| StorageError::new(format!("missing column family {}", cf_name)))?;
                for item in db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
                    let (k, v) = item.map_err(|e| StorageError::new(e.to_string()))?;
                    let mut hasher = Sha256::new();
                    hasher.update(&k);
                    hasher.update(&v);
                    let entry_digest = hasher.finalize();
                    for (a, b) in acc.iter_mut().zip(entry_digest.iter()) {
                        *a ^= b;
                    }
                }
            }
            Ok(acc)
        })
        .await
        .map_err(|e| StorageError::new(format!("join error: {}", e)))??;
        Ok(hex::encode(digest))
    }

    async fn save_height(&self, hash: &str, height: i32) -> ProcResult<()> {
        let mut pending = self.pending.lock().await;
        pending.put(CF_CHAIN_STATE, b"height".to_vec(), height.to_le_bytes().to_vec());
        pending.put(CF_CHAIN_STATE, b"last_hash".to_vec(), hash.as_bytes().to_vec());
        Ok(())
    }

    async fn get_history(&self, address: &str) -> ProcResult<Vec<HistoryEntry>> {
        match self
            .get_bytes(CF_HISTORY, key_string("hist", address))
            .await?
        {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| StorageError::new(format!("corrupt history record: {}", e)).into()),
            None => Ok(Vec::new()),
        }
    }

    async fn get_balance(&self, address: &str) -> ProcResult<i64> {
        let utxos = self.listunspent(address).await?;
        Ok(utxos.iter().map(|(_, u)| u.value).sum())
    }

    /// Simplified SPV proof: concatenated sorted UTXO-key hashes for this
    /// address, hashed once. Not a Merkle-Patricia proof (trie is out of
    /// scope per spec.md §1); sufficient only to prove "this is the set the
    /// root hash committed to" for the same simplified root.
    async fn get_proof(&self, address: &str) -> ProcResult<Vec<u8>> {
        let utxos = self.listunspent(address).await?;
        let mut hasher = Sha256::new();
        let mut keys: Vec<&Vec<u8>> = utxos.iter().map(|(k, _)| k).collect();
        keys.sort();
        for key in keys {
            hasher.update(key);
        }
        Ok(hasher.finalize().to_vec())
    }

    async fn listunspent(&self, address: &str) -> ProcResult<Vec<(Vec<u8>, Utxo)>> {
        let db = self.db.clone();
        let prefix = format!("addr:{}:", address).into_bytes();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(CF_UTXO)
                .ok_or_else(|| StorageError::new("missing column family utxo"))?;
            let mut out = Vec::new();
            for item in db.iterator_cf(
                &cf,
                rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
            ) {
                let (k, v) = item.map_err(|e| StorageError::new(e.to_string()))?;
                if !k.starts_with(&prefix) {
                    break;
                }
                let utxo: Utxo = bincode::deserialize(&v)
                    .map_err(|e| StorageError::new(format!("corrupt utxo record: {}", e)))?;
                out.push((k.to_vec(), utxo));
            }
            Ok(out)
        })
        .await
        .map_err(|e| StorageError::new(format!("join error: {}", e)))?
    }

    async fn get_address(&self, outpoint_bytes: &[u8]) -> ProcResult<Option<String>> {
        let mut key = b"outp:".to_vec();
        key.extend_from_slice(outpoint_bytes);
        match self.get_bytes(CF_UTXO, key).await? {
            Some(bytes) => {
                let utxo: Utxo = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::new(format!("corrupt utxo record: {}", e)))?;
                Ok(Some(utxo.address))
            }
            None => Ok(None),
        }
    }

    async fn get_utxo_value(&self, _address: &str, outpoint_bytes: &[u8]) -> ProcResult<Option<i64>> {
        let mut key = b"outp:".to_vec();
        key.extend_from_slice(outpoint_bytes);
        match self.get_bytes(CF_UTXO, key).await? {
            Some(bytes) => {
                let utxo: Utxo = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::new(format!("corrupt utxo record: {}", e)))?;
                Ok(Some(utxo.value))
            }
            None => Ok(None),
        }
    }

    async fn import_transaction(
        &self,
        _txid: &str,
        height: i32,
        spends: &[(Vec<u8>, String)],
        creates: &[(Vec<u8>, Utxo)],
    ) -> ProcResult<UndoInfo> {
        let mut undo = UndoInfo::default();
        let mut pending = self.pending.lock().await;

        for (outpoint_key, _address) in spends {
            let mut key = b"outp:".to_vec();
            key.extend_from_slice(outpoint_key);
            // An earlier tx in this same block may have created this output;
            // that write is still buffered in `pending` and hasn't reached
            // the committed DB yet (batch_write runs once per block), so it
            // must be checked before falling back to `get_bytes`.
            let utxo_bytes = match pending.get_pending(CF_UTXO, &key) {
                Some(buffered) => buffered,
                None => self.get_bytes(CF_UTXO, key.clone()).await?,
            };
            if let Some(bytes) = utxo_bytes {
                let utxo: Utxo = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::new(format!("corrupt utxo record: {}", e)))?;
                undo.spent.push((outpoint_key.clone(), utxo.clone()));
                pending.delete(CF_UTXO, key);
                pending.delete(
                    CF_UTXO,
                    {
                        let mut addr_key = format!("addr:{}:", utxo.address).into_bytes();
                        addr_key.extend_from_slice(outpoint_key);
                        addr_key
                    },
                );
            }
        }

        for (outpoint_key, utxo) in creates {
            let mut key = b"outp:".to_vec();
            key.extend_from_slice(outpoint_key);
            let value = bincode::serialize(utxo)
                .map_err(|e| StorageError::new(format!("encode utxo: {}", e)))?;
            pending.put(CF_UTXO, key, value.clone());
            let mut addr_key = format!("addr:{}:", utxo.address).into_bytes();
            addr_key.extend_from_slice(outpoint_key);
            pending.put(CF_UTXO, addr_key, value);
            undo.created.push(outpoint_key.clone());
        }

        let _ = height;
        Ok(undo)
    }

    async fn revert_transaction(&self, undo: &UndoInfo) -> ProcResult<()> {
        let mut pending = self.pending.lock().await;
        for outpoint_key in &undo.created {
            let mut key = b"outp:".to_vec();
            key.extend_from_slice(outpoint_key);
            if let Some(bytes) = self.get_bytes(CF_UTXO, key.clone()).await? {
                let utxo: Utxo = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::new(format!("corrupt utxo record: {}", e)))?;
                let mut addr_key = format!("addr:{}:", utxo.address).into_bytes();
                addr_key.extend_from_slice(outpoint_key);
                pending.delete(CF_UTXO, addr_key);
            }
            pending.delete(CF_UTXO, key);
        }
        for (outpoint_key, utxo) in &undo.spent {
            let mut key = b"outp:".to_vec();
            key.extend_from_slice(outpoint_key);
            let value = bincode::serialize(utxo)
                .map_err(|e| StorageError::new(format!("encode utxo: {}", e)))?;
            pending.put(CF_UTXO, key, value.clone());
            let mut addr_key = format!("addr:{}:", utxo.address).into_bytes();
            addr_key.extend_from_slice(outpoint_key);
            pending.put(CF_UTXO, addr_key, value);
        }
        Ok(())
    }

    async fn import_claim_transaction(&self, claims: &[ClaimRecord]) -> ProcResult<UndoClaimInfo> {
        let mut undo = UndoClaimInfo::default();
        let mut pending = self.pending.lock().await;
        for claim in claims {
            let key = key_string("claim", &claim.claim_id);
            let value = bincode::serialize(claim)
                .map_err(|e| StorageError::new(format!("encode claim: {}", e)))?;
            pending.put(CF_CLAIMS, key, value);
            let outp_key = key_string("claim-outp", &format!("{}:{}", claim.txid, claim.nout));
            pending.put(CF_CLAIMS, outp_key, claim.claim_id.as_bytes().to_vec());
            undo.created.push(claim.clone());
        }
        Ok(undo)
    }

    async fn revert_claim_transaction(&self, undo: &UndoClaimInfo) -> ProcResult<()> {
        let mut pending = self.pending.lock().await;
        for claim in &undo.created {
            pending.delete(CF_CLAIMS, key_string("claim", &claim.claim_id));
            pending.delete(
                CF_CLAIMS,
                key_string("claim-outp", &format!("{}:{}", claim.txid, claim.nout)),
            );
        }
        for (claim_id, claim) in &undo.removed {
            let key = key_string("claim", claim_id);
            let value = bincode::serialize(claim)
                .map_err(|e| StorageError::new(format!("encode claim: {}", e)))?;
            pending.put(CF_CLAIMS, key, value);
            let outp_key = key_string("claim-outp", &format!("{}:{}", claim.txid, claim.nout));
            pending.put(CF_CLAIMS, outp_key, claim_id.as_bytes().to_vec());
        }
        Ok(())
    }

    async fn get_undo_info(&self, height: i32) -> ProcResult<Option<UndoInfo>> {
        match self
            .get_bytes(CF_UTXO_UNDO, height.to_le_bytes().to_vec())
            .await?
        {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::new(format!("corrupt undo record: {}", e)))?,
            )),
            None => Ok(None),
        }
    }

    async fn get_undo_claim_info(&self, height: i32) -> ProcResult<Option<UndoClaimInfo>> {
        match self
            .get_bytes(CF_CLAIM_UNDO, height.to_le_bytes().to_vec())
            .await?
        {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::new(format!("corrupt claim undo record: {}", e)))?,
            )),
            None => Ok(None),
        }
    }

    async fn write_undo_info(&self, height: i32, undo: &UndoInfo) -> ProcResult<()> {
        let value = bincode::serialize(undo)
            .map_err(|e| StorageError::new(format!("encode undo: {}", e)))?;
        self.pending
            .lock()
            .await
            .put(CF_UTXO_UNDO, height.to_le_bytes().to_vec(), value);
        Ok(())
    }

    async fn write_undo_claim_info(&self, height: i32, undo: &UndoClaimInfo) -> ProcResult<()> {
        let value = bincode::serialize(undo)
            .map_err(|e| StorageError::new(format!("encode claim undo: {}", e)))?;
        self.pending
            .lock()
            .await
            .put(CF_CLAIM_UNDO, height.to_le_bytes().to_vec(), value);
        Ok(())
    }

    async fn update_hashes(&self) -> ProcResult<()> {
        Ok(())
    }

    async fn batch_write(&self) -> ProcResult<()> {
        let mut pending = self.pending.lock().await;
        pending
            .flush()
            .await
            .map_err(|e| StorageError::new(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> ProcResult<()> {
        self.batch_write().await
    }

    async fn get_claim_name(&self, claim_id: &str) -> ProcResult<Option<String>> {
        Ok(self.load_claim(claim_id).await?.map(|c| c.name))
    }

    async fn get_claim_value(&self, claim_id: &str) -> ProcResult<Option<Vec<u8>>> {
        Ok(self.load_claim(claim_id).await?.map(|c| c.value))
    }

    async fn get_claim_height(&self, claim_id: &str) -> ProcResult<Option<i32>> {
        Ok(self.load_claim(claim_id).await?.map(|c| c.height))
    }

    async fn get_claim_address(&self, claim_id: &str) -> ProcResult<Option<String>> {
        Ok(self.load_claim(claim_id).await?.map(|c| c.address))
    }

    async fn get_outpoint_from_claim_id(&self, claim_id: &str) -> ProcResult<Option<(String, u32)>> {
        Ok(self.load_claim(claim_id).await?.map(|c| (c.txid, c.nout)))
    }

    async fn get_claim_id_from_outpoint(&self, txid: &str, nout: u32) -> ProcResult<Option<String>> {
        let key = key_string("claim-outp", &format!("{}:{}", txid, nout));
        match self.get_bytes(CF_CLAIMS, key).await? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    async fn get_n_for_name_and_claimid(&self, name: &str, claim_id: &str) -> ProcResult<Option<u32>> {
        let claims = self.claims_for_name(name).await?;
        let mut sorted = claims;
        sorted.sort_by_key(|c| c.height);
        Ok(sorted.iter().position(|c| c.claim_id == claim_id).map(|p| p as u32))
    }

    async fn get_claimid_for_nth_claim_to_name(&self, name: &str, n: u32) -> ProcResult<Option<String>> {
        let mut claims = self.claims_for_name(name).await?;
        claims.sort_by_key(|c| c.height);
        Ok(claims.get(n as usize).map(|c| c.claim_id.clone()))
    }

    async fn get_claims_signed_by(&self, certificate_id: &str) -> ProcResult<Vec<ClaimRecord>> {
        self.claims_with(|c| c.certificate_id.as_deref() == Some(certificate_id))
            .await
    }
}

impl RocksStorage {
    async fn load_claim(&self, claim_id: &str) -> ProcResult<Option<ClaimRecord>> {
        match self.get_bytes(CF_CLAIMS, key_string("claim", claim_id)).await? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::new(format!("corrupt claim record: {}", e)))?,
            )),
            None => Ok(None),
        }
    }

    async fn claims_for_name(&self, name: &str) -> ProcResult<Vec<ClaimRecord>> {
        let name = name.to_string();
        self.claims_with(move |c| c.name == name).await
    }

    /// Scans every stored claim record, keeping those matching `predicate`.
    /// Shared by `claims_for_name` and `Storage::get_claims_signed_by`, both
    /// of which have no secondary index to consult and fall back to a full
    /// column-family walk (acceptable here: claim volume is far smaller than
    /// UTXO volume, matching the original's in-memory `claim_cache` scans).
    async fn claims_with<F>(&self, predicate: F) -> ProcResult<Vec<ClaimRecord>>
    where
        F: Fn(&ClaimRecord) -> bool + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(CF_CLAIMS)
                .ok_or_else(|| StorageError::new("missing column family claims"))?;
            let mut out = Vec::new();
            let prefix = b"claim:".to_vec();
            for item in db.iterator_cf(
                &cf,
                rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
            ) {
                let (k, v) = item.map_err(|e| StorageError::new(e.to_string()))?;
                if !k.starts_with(&prefix) {
                    break;
                }
                let claim: ClaimRecord = bincode::deserialize(&v)
                    .map_err(|e| StorageError::new(format!("corrupt claim record: {}", e)))?;
                if predicate(&claim) {
                    out.push(claim);
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| StorageError::new(format!("join error: {}", e)))?
    }
}

pub type SharedStorage = Arc<dyn Storage>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_utxo(address: &str, value: i64) -> Utxo {
        Utxo {
            address: address.to_string(),
            value,
            height: 10,
        }
    }

    #[tokio::test]
    async fn fresh_storage_starts_at_height_minus_one() {
        let dir = tempdir().unwrap();
        let storage = RocksStorage::open(dir.path()).unwrap();
        assert_eq!(storage.height().await.unwrap(), -1);
        assert!(storage.last_hash().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn import_then_revert_restores_root_hash() {
        let dir = tempdir().unwrap();
        let storage = RocksStorage::open(dir.path()).unwrap();
        let before = storage.get_root_hash().await.unwrap();

        let outpoint = vec![1u8; 36];
        let undo = storage
            .import_transaction(
                "t1",
                10,
                &[],
                &[(outpoint.clone(), sample_utxo("addr1", 500))],
            )
            .await
            .unwrap();
        storage.batch_write().await.unwrap();
        let after_import = storage.get_root_hash().await.unwrap();
        assert_ne!(before, after_import);

        storage.revert_transaction(&undo).await.unwrap();
        storage.batch_write().await.unwrap();
        let after_revert = storage.get_root_hash().await.unwrap();
        assert_eq!(before, after_revert);
    }

    #[tokio::test]
    async fn listunspent_and_balance_reflect_imported_utxo() {
        let dir = tempdir().unwrap();
        let storage = RocksStorage::open(dir.path()).unwrap();
        let outpoint = vec![2u8; 36];
        storage
            .import_transaction(
                "t2",
                11,
                &[],
                &[(outpoint, sample_utxo("addr2", 1234))],
            )
            .await
            .unwrap();
        storage.batch_write().await.unwrap();

        let unspent = storage.listunspent("addr2").await.unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(storage.get_balance("addr2").await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn claim_round_trips_through_storage() {
        let dir = tempdir().unwrap();
        let storage = RocksStorage::open(dir.path()).unwrap();
        let claim = ClaimRecord {
            claim_id: "c1".to_string(),
            name: "example".to_string(),
            value: vec![9, 9],
            height: 5,
            address: "addr3".to_string(),
            txid: "t3".to_string(),
            nout: 0,
            amount: 100,
            certificate_id: Some("cert1".to_string()),
        };
        storage
            .import_claim_transaction(&[claim.clone()])
            .await
            .unwrap();
        storage.batch_write().await.unwrap();

        assert_eq!(
            storage.get_claim_name("c1").await.unwrap(),
            Some("example".to_string())
        );
        assert_eq!(
            storage.get_claim_id_from_outpoint("t3", 0).await.unwrap(),
            Some("c1".to_string())
        );
        assert_eq!(
            storage.get_claimid_for_nth_claim_to_name("example", 0).await.unwrap(),
            Some("c1".to_string())
        );
    }

    #[tokio::test]
    async fn claims_signed_by_certificate_are_found_by_scan() {
        let dir = tempdir().unwrap();
        let storage = RocksStorage::open(dir.path()).unwrap();
        let signed = ClaimRecord {
            claim_id: "c2".to_string(),
            name: "signed-video".to_string(),
            value: vec![1, 2, 3],
            height: 6,
            address: "addr4".to_string(),
            txid: "t4".to_string(),
            nout: 0,
            amount: 50,
            certificate_id: Some("cert1".to_string()),
        };
        let unsigned = ClaimRecord {
            claim_id: "c3".to_string(),
            name: "other-video".to_string(),
            value: vec![4, 5, 6],
            height: 6,
            address: "addr5".to_string(),
            txid: "t5".to_string(),
            nout: 0,
            amount: 50,
            certificate_id: None,
        };
        storage
            .import_claim_transaction(&[signed, unsigned])
            .await
            .unwrap();
        storage.batch_write().await.unwrap();

        let found = storage.get_claims_signed_by("cert1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].claim_id, "c2");

        assert!(storage.get_claims_signed_by("no-such-cert").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_height_persists_after_batch_write() {
        let dir = tempdir().unwrap();
        let storage = RocksStorage::open(dir.path()).unwrap();
        storage.save_height("deadbeef", 42).await.unwrap();
        storage.batch_write().await.unwrap();
        assert_eq!(storage.height().await.unwrap(), 42);
        assert_eq!(storage.last_hash().await.unwrap().unwrap(), "deadbeef");
    }
}
