/// Transaction decoding boundary (spec.md §3's `TxCodec`).
///
/// The original `deserialize.parse_Transaction` in
/// `examples/original_source/ddcsumserver/blockchain_processor.py` is only
/// ever consumed for its output/input shape (address, value, prevout) — never
/// for script interpretation, which stays out of scope (no consensus
/// validation). `RawTxCodec` mirrors that: it reads the daemon's own verbose
/// decoding (`ChainClient::get_raw_transaction_verbose`) instead of parsing
/// the wire format itself.
use crate::chain_client::RawTransactionVerbose;
use crate::errors::{ProcResult, ProcessorError};
use crate::types::{ParsedTransaction, TxInput, TxOutput};

/// Converts sats-as-float (the daemon's JSON convention) to integer satoshis.
fn to_satoshis(value: f64) -> i64 {
    (value * 100_000_000.0).round() as i64
}

const OP_CLAIM_NAME: u8 = 0xb5;
const OP_SUPPORT_CLAIM: u8 = 0xb6;
const OP_UPDATE_CLAIM: u8 = 0xb7;

/// Reads one pushdata item off `script` at `*pos`, advancing past it.
fn read_pushdata(script: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let op = *script.get(*pos)?;
    *pos += 1;
    let len = match op {
        0x01..=0x4b => op as usize,
        0x4c => {
            let l = *script.get(*pos)? as usize;
            *pos += 1;
            l
        }
        0x4d => {
            let bytes = script.get(*pos..*pos + 2)?;
            let l = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
            *pos += 2;
            l
        }
        _ => return None,
    };
    let data = script.get(*pos..*pos + len)?.to_vec();
    *pos += len;
    Some(data)
}

/// Recognizes `<name> <value> OP_CLAIM_NAME ...` and
/// `<name> <claim_id> <value> OP_UPDATE_CLAIM ...`, returning the claimed
/// name and its value payload. `OP_SUPPORT_CLAIM` scripts carry no value of
/// their own and are not claim records; the matching-supports data
/// `claim_resolver.rs` surfaces comes live from the daemon instead
/// (`get_claims_for_name`'s `supports` field), so they decode to `None`.
/// Anything that isn't a recognized claim-trie script template also decodes
/// to `None` — ordinary payment outputs are never mistaken for claims.
pub(crate) fn decode_claim_script(script: &[u8]) -> Option<(String, Vec<u8>)> {
    let mut pos = 0;
    let name = read_pushdata(script, &mut pos)?;
    let second = read_pushdata(script, &mut pos)?;
    match *script.get(pos)? {
        OP_CLAIM_NAME => Some((String::from_utf8_lossy(&name).into_owned(), second)),
        OP_UPDATE_CLAIM => {
            pos += 1;
            let value = read_pushdata(script, &mut pos)?;
            Some((String::from_utf8_lossy(&name).into_owned(), value))
        }
        OP_SUPPORT_CLAIM => None,
        _ => None,
    }
}

pub trait TxCodec: Send + Sync {
    fn parse(&self, verbose: &RawTransactionVerbose) -> ProcResult<ParsedTransaction>;
}

pub struct RawTxCodec;

impl TxCodec for RawTxCodec {
    fn parse(&self, verbose: &RawTransactionVerbose) -> ProcResult<ParsedTransaction> {
        let is_coinbase = verbose
            .vin
            .first()
            .map(|v| v.coinbase.is_some())
            .unwrap_or(false);

        let inputs = if is_coinbase {
            Vec::new()
        } else {
            verbose
                .vin
                .iter()
                .map(|v| {
                    Ok(TxInput {
                        prevout_hash: v
                            .txid
                            .clone()
                            .ok_or_else(|| ProcessorError::Decode("input missing txid".into()))?,
                        prevout_n: v.vout.ok_or_else(|| {
                            ProcessorError::Decode("input missing vout index".into())
                        })?,
                    })
                })
                .collect::<ProcResult<Vec<_>>>()?
        };

        let outputs = verbose
            .vout
            .iter()
            .map(|v| TxOutput {
                address: v.script_pub_key.addresses.first().cloned(),
                value: to_satoshis(v.value),
                claim_script: hex::decode(&v.script_pub_key.hex)
                    .ok()
                    .filter(|bytes| decode_claim_script(bytes).is_some()),
            })
            .collect();

        Ok(ParsedTransaction {
            txid: verbose.txid.clone(),
            is_coinbase,
            inputs,
            outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::{ScriptPubKey, VerboseVin, VerboseVout};

    fn sample_verbose() -> RawTransactionVerbose {
        RawTransactionVerbose {
            hex: "00".to_string(),
            txid: "t1".to_string(),
            confirmations: None,
            vin: vec![VerboseVin {
                txid: Some("prev1".to_string()),
                vout: Some(0),
                coinbase: None,
            }],
            vout: vec![VerboseVout {
                value: 1.5,
                n: 0,
                script_pub_key: ScriptPubKey {
                    addresses: vec!["addr1".to_string()],
                    hex: "76a914".to_string(),
                },
            }],
        }
    }

    #[test]
    fn parses_regular_transaction() {
        let parsed = RawTxCodec.parse(&sample_verbose()).unwrap();
        assert!(!parsed.is_coinbase);
        assert_eq!(parsed.inputs.len(), 1);
        assert_eq!(parsed.inputs[0].prevout_hash, "prev1");
        assert_eq!(parsed.outputs[0].value, 150_000_000);
        assert_eq!(parsed.outputs[0].address.as_deref(), Some("addr1"));
    }

    #[test]
    fn coinbase_transaction_has_no_inputs() {
        let mut verbose = sample_verbose();
        verbose.vin = vec![VerboseVin {
            txid: None,
            vout: None,
            coinbase: Some("04ffff001d0104".to_string()),
        }];
        let parsed = RawTxCodec.parse(&verbose).unwrap();
        assert!(parsed.is_coinbase);
        assert!(parsed.inputs.is_empty());
    }

    #[test]
    fn to_satoshis_rounds_floating_point_correctly() {
        assert_eq!(to_satoshis(0.00000001), 1);
        assert_eq!(to_satoshis(21.0), 2_100_000_000);
    }

    fn push(data: &[u8]) -> Vec<u8> {
        let mut out = vec![data.len() as u8];
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn decodes_claim_name_script() {
        let mut script = push(b"somename");
        script.extend(push(b"somevalue"));
        script.push(OP_CLAIM_NAME);
        script.extend([0x6d, 0x75]); // OP_2DROP OP_DROP, not interpreted
        let (name, value) = decode_claim_script(&script).unwrap();
        assert_eq!(name, "somename");
        assert_eq!(value, b"somevalue");
    }

    #[test]
    fn decodes_update_claim_script() {
        let mut script = push(b"somename");
        script.extend(push(b"deadbeef"));
        script.extend(push(b"newvalue"));
        script.push(OP_UPDATE_CLAIM);
        let (name, value) = decode_claim_script(&script).unwrap();
        assert_eq!(name, "somename");
        assert_eq!(value, b"newvalue");
    }

    #[test]
    fn support_claim_script_is_not_a_claim_record() {
        let mut script = push(b"somename");
        script.extend(push(b"deadbeef"));
        script.push(OP_SUPPORT_CLAIM);
        assert!(decode_claim_script(&script).is_none());
    }

    #[test]
    fn ordinary_output_script_is_not_a_claim() {
        let script = hex::decode("76a914").unwrap();
        assert!(decode_claim_script(&script).is_none());
    }

    #[test]
    fn parsed_transaction_only_tags_claim_scripts() {
        let mut verbose = sample_verbose();
        let mut claim_script = push(b"somename");
        claim_script.extend(push(b"somevalue"));
        claim_script.push(OP_CLAIM_NAME);
        verbose.vout[0].script_pub_key.hex = hex::encode(&claim_script);
        let parsed = RawTxCodec.parse(&verbose).unwrap();
        assert_eq!(parsed.outputs[0].claim_script, Some(claim_script));

        let plain = RawTxCodec.parse(&sample_verbose()).unwrap();
        assert_eq!(plain.outputs[0].claim_script, None);
    }
}
