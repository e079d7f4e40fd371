/// Core data model: headers, parsed transactions, and small value types shared
/// across the processor. Mirrors the wire shapes in spec.md §3 rather than any
/// particular script-interpretation model (Non-goal: no consensus validation).
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const HEADER_SIZE: usize = 112;
pub const BLOCKS_PER_CHUNK: usize = 96;

/// Production-ready error type with context, used for request-facing messages.
/// Internal control flow uses `crate::errors::ProcessorError` instead.
#[derive(Debug, Clone)]
pub struct MyError {
    pub message: String,
}

impl MyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for MyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MyError {}

/// A 32-byte hash that displays as reversed-byte hex, matching the daemon's
/// convention for block/tx ids (spec.md §3: "returned as a reversed-byte hex string").
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; 32]);

impl fmt::LowerHex for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl Hash {
    pub fn to_hex(&self) -> String {
        format!("{:x}", self)
    }
}

/// Double-SHA256, as used for both header and transaction ids.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Fixed 112-byte block header record (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub height: i32,
    pub version: u32,
    pub prev_block_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub claim_trie_root: [u8; 32],
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl Header {
    /// Canonical wire serialization: concatenation of fields in listed order.
    /// Height is not part of the on-disk 108-byte payload (it is implicit in the
    /// record's file offset) but is carried alongside it for convenience; the
    /// hashed/stored form is exactly `HEADER_SIZE` bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(&self.prev_block_hash);
        buf[36..68].copy_from_slice(&self.merkle_root);
        buf[68..100].copy_from_slice(&self.claim_trie_root);
        buf[100..104].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[104..108].copy_from_slice(&self.bits.to_le_bytes());
        buf[108..112].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    pub fn from_bytes(height: i32, bytes: &[u8; HEADER_SIZE]) -> Self {
        Header {
            height,
            version: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            prev_block_hash: bytes[4..36].try_into().unwrap(),
            merkle_root: bytes[36..68].try_into().unwrap(),
            claim_trie_root: bytes[68..100].try_into().unwrap(),
            timestamp: u32::from_le_bytes(bytes[100..104].try_into().unwrap()),
            bits: u32::from_le_bytes(bytes[104..108].try_into().unwrap()),
            nonce: u32::from_le_bytes(bytes[108..112].try_into().unwrap()),
        }
    }

    /// Record hash: double-SHA256 of the serialized form, reversed-byte hex.
    pub fn block_hash(&self) -> Hash {
        Hash(sha256d(&self.to_bytes()))
    }

    pub fn block_hash_hex(&self) -> String {
        self.block_hash().to_hex()
    }
}

/// A UTXO reference, `(txid, output index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: String,
    pub n: u32,
}

impl Outpoint {
    /// Encodes as the 36-byte key storage uses: reversed txid bytes + LE index,
    /// matching the original implementation's `(prevout_hash + int_to_hex(n, 4)).decode('hex')`.
    pub fn to_key_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        let mut txid_bytes = hex::decode(&self.txid)?;
        txid_bytes.reverse();
        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(&txid_bytes);
        out.extend_from_slice(&self.n.to_le_bytes());
        Ok(out)
    }
}

/// A single transaction output, decoded only to the extent the processor needs:
/// destination address (if standard) and value. Claim-script parts are carried
/// as opaque bytes for `Storage::import_claim_transaction` to interpret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Option<String>,
    pub value: i64,
    pub claim_script: Option<Vec<u8>>,
}

/// A single transaction input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInput {
    pub prevout_hash: String,
    pub prevout_n: u32,
}

/// A parsed transaction: ordered inputs and outputs, with coinbase flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedTransaction {
    pub txid: String,
    pub is_coinbase: bool,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// A history entry as returned to clients: `{tx_hash, height}`, `height == 0` for mempool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: String,
    pub height: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = Header {
            height: 42,
            version: 1,
            prev_block_hash: [1u8; 32],
            merkle_root: [2u8; 32],
            claim_trie_root: [3u8; 32],
            timestamp: 1_700_000_000,
            bits: 0x1e0ffff0,
            nonce: 12345,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = Header::from_bytes(42, &bytes);
        assert_eq!(header, parsed);
    }

    #[test]
    fn block_hash_is_reversed_hex_of_double_sha256() {
        let header = Header {
            height: 0,
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            claim_trie_root: [0u8; 32],
            timestamp: 0,
            bits: 0,
            nonce: 0,
        };
        let expected = sha256d(&header.to_bytes());
        let mut expected_rev = expected;
        expected_rev.reverse();
        assert_eq!(header.block_hash_hex(), hex::encode(expected_rev));
    }

    #[test]
    fn outpoint_key_bytes_reverses_txid() {
        let op = Outpoint {
            txid: "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff".to_string(),
            n: 1,
        };
        let key = op.to_key_bytes().unwrap();
        assert_eq!(key.len(), 36);
        assert_eq!(&key[32..36], &1u32.to_le_bytes());
    }
}
