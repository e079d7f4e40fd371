/// JSON-RPC client for the reference full-node daemon (spec.md §6's
/// `ChainClient`, an external collaborator whose contract we consume through
/// a trait).
///
/// Grounded on the teacher's raw-JSON-RPC idiom in
/// `examples/Liquid369-rusty-blox/src/monitor.rs::index_block_from_rpc`
/// (`reqwest::blocking::Client` + `basic_auth` + `{"jsonrpc":"1.0",...}`
/// wrapped in `tokio::task::spawn_blocking`), generalized from one hard-coded
/// method call to the generic `call(method, params)` the original
/// `ddcscrdd()` dispatcher in
/// `examples/original_source/ddcsumserver/blockchain_processor.py` provides —
/// needed because several RPC methods this processor calls
/// (`getclaimsforname`, `getnameproof`, `getvalueforname`, `getclaimsfortx`)
/// have no typed equivalent in any available bitcoin-core-shaped RPC crate.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::DaemonSettings;
use crate::errors::{ProcResult, ProcessorError};
use crate::types::Header;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: i32,
    pub version: u32,
    pub previousblockhash: Option<String>,
    pub merkleroot: String,
    #[serde(default, rename = "nameclaimroot")]
    pub claim_trie_root: Option<String>,
    pub time: u32,
    pub bits: String,
    pub nonce: u32,
    pub tx: Vec<String>,
}

impl BlockInfo {
    pub fn to_header(&self) -> ProcResult<Header> {
        let prev_block_hash = match &self.previousblockhash {
            Some(h) => decode_reversed_hash(h)?,
            None => [0u8; 32],
        };
        Ok(Header {
            height: self.height,
            version: self.version,
            prev_block_hash,
            merkle_root: decode_reversed_hash(&self.merkleroot)?,
            claim_trie_root: match &self.claim_trie_root {
                Some(h) => decode_reversed_hash(h)?,
                None => [0u8; 32],
            },
            timestamp: self.time,
            bits: u32::from_str_radix(&self.bits, 16)
                .map_err(|e| ProcessorError::Decode(format!("bad bits field: {}", e)))?,
            nonce: self.nonce,
        })
    }
}

fn decode_reversed_hash(hex_str: &str) -> ProcResult<[u8; 32]> {
    let mut bytes = hex::decode(hex_str)
        .map_err(|e| ProcessorError::Decode(format!("bad hash hex '{}': {}", hex_str, e)))?;
    if bytes.len() != 32 {
        return Err(ProcessorError::Decode(format!(
            "expected 32-byte hash, got {} bytes",
            bytes.len()
        )));
    }
    bytes.reverse();
    Ok(bytes.try_into().unwrap())
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonInfo {
    pub blocks: i32,
    pub relayfee: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerboseVin {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub hex: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerboseVout {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

/// The daemon's decoded transaction view (`getrawtransaction ... 1`). Outputs
/// already carry resolved addresses, so the processor never interprets
/// scripts itself (Non-goal: no consensus validation).
#[derive(Debug, Clone, Deserialize)]
pub struct RawTransactionVerbose {
    pub hex: String,
    pub txid: String,
    #[serde(default)]
    pub confirmations: Option<i32>,
    pub vin: Vec<VerboseVin>,
    pub vout: Vec<VerboseVout>,
}

/// The daemon JSON-RPC surface this processor consumes (spec.md §6).
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_info(&self) -> ProcResult<DaemonInfo>;
    async fn get_block_hash(&self, height: i32) -> ProcResult<String>;
    async fn get_block(&self, hash: &str) -> ProcResult<BlockInfo>;
    async fn get_raw_transaction(&self, txid: &str) -> ProcResult<String>;
    async fn get_raw_transaction_verbose(&self, txid: &str) -> ProcResult<RawTransactionVerbose>;
    async fn get_raw_mempool(&self) -> ProcResult<Vec<String>>;
    async fn get_claims_for_name(&self, name: &str) -> ProcResult<Value>;
    async fn get_name_proof(&self, name: &str, block_hash: Option<&str>) -> ProcResult<Value>;
    async fn get_value_for_name(&self, name: &str) -> ProcResult<Value>;
    async fn get_claims_for_tx(&self, txid: &str) -> ProcResult<Value>;
    async fn send_raw_transaction(&self, raw: &str) -> ProcResult<String>;
    async fn estimate_fee(&self, n: u32) -> ProcResult<f64>;

    /// Fetches a header by height via `getblockhash` + `getblock`, matching
    /// `BlockchainProcessorBase.get_header` in the original source.
    async fn get_header(&self, height: i32) -> ProcResult<Header> {
        let hash = self.get_block_hash(height).await?;
        let block = self.get_block(&hash).await?;
        block.to_header()
    }
}

pub struct RpcChainClient {
    url: String,
    user: String,
    password: String,
    http: reqwest::Client,
}

impl RpcChainClient {
    pub fn new(settings: &DaemonSettings) -> Self {
        Self {
            url: format!("http://{}:{}/", settings.host, settings.port),
            user: settings.user.clone(),
            password: settings.password.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// The single JSON-RPC entry point every method call goes through,
    /// mirroring `ddcscrdd()` in the original source: classifies daemon
    /// error codes into the processor's error taxonomy (spec.md §7).
    async fn call(&self, method: &str, params: Value) -> ProcResult<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "ddcs-processor",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProcessorError::DaemonUnavailable(e.to_string()))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProcessorError::DaemonFatal(format!("invalid JSON from daemon: {}", e)))?;

        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown daemon error");
            return Err(ProcessorError::from_rpc_error(code, message));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ProcessorError::DaemonFatal("missing result field".to_string()))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn get_info(&self) -> ProcResult<DaemonInfo> {
        let value = self.call("getinfo", json!([])).await?;
        serde_json::from_value(value).map_err(|e| ProcessorError::Decode(e.to_string()))
    }

    async fn get_block_hash(&self, height: i32) -> ProcResult<String> {
        let value = self.call("getblockhash", json!([height])).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProcessorError::Decode("getblockhash did not return a string".into()))
    }

    async fn get_block(&self, hash: &str) -> ProcResult<BlockInfo> {
        let value = self.call("getblock", json!([hash])).await?;
        serde_json::from_value(value).map_err(|e| ProcessorError::Decode(e.to_string()))
    }

    async fn get_raw_transaction(&self, txid: &str) -> ProcResult<String> {
        let value = self.call("getrawtransaction", json!([txid, 0])).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProcessorError::Decode("getrawtransaction did not return a string".into()))
    }

    async fn get_raw_transaction_verbose(&self, txid: &str) -> ProcResult<RawTransactionVerbose> {
        let value = self.call("getrawtransaction", json!([txid, 1])).await?;
        serde_json::from_value(value).map_err(|e| ProcessorError::Decode(e.to_string()))
    }

    async fn get_raw_mempool(&self) -> ProcResult<Vec<String>> {
        let value = self.call("getrawmempool", json!([])).await?;
        serde_json::from_value(value).map_err(|e| ProcessorError::Decode(e.to_string()))
    }

    async fn get_claims_for_name(&self, name: &str) -> ProcResult<Value> {
        self.call("getclaimsforname", json!([name])).await
    }

    async fn get_name_proof(&self, name: &str, block_hash: Option<&str>) -> ProcResult<Value> {
        match block_hash {
            Some(h) => self.call("getnameproof", json!([name, h])).await,
            None => self.call("getnameproof", json!([name])).await,
        }
    }

    async fn get_value_for_name(&self, name: &str) -> ProcResult<Value> {
        self.call("getvalueforname", json!([name])).await
    }

    async fn get_claims_for_tx(&self, txid: &str) -> ProcResult<Value> {
        self.call("getclaimsfortx", json!([txid])).await
    }

    async fn send_raw_transaction(&self, raw: &str) -> ProcResult<String> {
        let value = self.call("sendrawtransaction", json!([raw])).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProcessorError::Decode("sendrawtransaction did not return a string".into()))
    }

    async fn estimate_fee(&self, n: u32) -> ProcResult<f64> {
        let value = self.call("estimatefee", json!([n])).await?;
        value
            .as_f64()
            .ok_or_else(|| ProcessorError::Decode("estimatefee did not return a number".into()))
    }
}

pub type SharedChainClient = Arc<dyn ChainClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_reversed_hash_hex() {
        let bytes = decode_reversed_hash(
            "001111111111111111111111111111111111111111111111111111111111110a",
        )
        .unwrap();
        assert_eq!(bytes[0], 0x0a);
        assert_eq!(bytes[31], 0x00);
    }

    #[test]
    fn block_info_converts_to_header() {
        let info = BlockInfo {
            height: 5,
            version: 1,
            previousblockhash: Some(
                "00000000000000000000000000000000000000000000000000000000000000ab".to_string(),
            ),
            merkleroot: "00000000000000000000000000000000000000000000000000000000000000cd"
                .to_string(),
            claim_trie_root: None,
            time: 1_700_000_000,
            bits: "1e0ffff0".to_string(),
            nonce: 7,
            tx: vec![],
        };
        let header = info.to_header().unwrap();
        assert_eq!(header.height, 5);
        assert_eq!(header.bits, 0x1e0ffff0);
    }
}
