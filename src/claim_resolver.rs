/// Resolves claim ids and name-claim URIs to claim/certificate records
/// (spec.md §4.7).
///
/// Grounded directly on `get_claim_info`, `cmd_claimtrie_getvalue`,
/// `get_signed_claims_with_name_for_channel`, and
/// `cmd_claimtrie_get_value_for_uri` in
/// `examples/original_source/ddcsumserver/blockchain_processor.py`. Per
/// spec.md §9, the original's `cmd_claimtrie_getvalue` reads `txid, nout`
/// local variables set only on the winning-claim branch, so a name with
/// claims but no current winner would read stale/undefined locals when
/// matching supports; here that branch is `Option<(String, u32)>` and the
/// supports-matching loop is simply skipped when it is `None`.
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Cache;
use crate::chain_client::SharedChainClient;
use crate::errors::ProcResult;
use crate::storage::SharedStorage;
use crate::uri::{ClaimDecoder, UriParser};

pub const CLAIM_ID: &str = "claim_id";
pub const WINNING: &str = "winning";
pub const SEQUENCE: &str = "sequence";

/// `True` iff `getnameproof`'s result names a winning claim, matching
/// `ddcscrd_proof_has_winning_claim`.
pub fn proof_has_winning_claim(proof: &Value) -> bool {
    proof.get("txhash").is_some() && proof.get("nOut").is_some()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimInfo {
    pub name: String,
    pub claim_id: String,
    pub txid: String,
    pub nout: u32,
    pub amount: i64,
    pub depth: i32,
    pub height: i32,
    pub value: String,
    pub claim_sequence: u32,
    pub address: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supports: Vec<(String, u32, i64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_at_height: Option<i32>,
}

/// Result of `blockchain.claimtrie.getvalue`: the raw `getnameproof` result
/// plus, when it names a winning claim, the transaction and claim record
/// backing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimValueResult {
    pub proof: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_sequence: Option<u32>,
    pub supports: Vec<(String, u32, i64)>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    ClaimId,
    Sequence,
    Winning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolvedResult {
    Claim(ClaimInfo),
    Value(ClaimValueResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolved {
    pub resolution_type: ResolutionType,
    pub result: ResolvedResult,
}

/// `(name, height)` pairs, matching the original's
/// `{cid: (storage.get_claim_name(cid), storage.get_claim_height(cid))}`.
pub type UnverifiedClaims = HashMap<String, (Option<String>, Option<i32>)>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UriResolution {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Resolved>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim: Option<Resolved>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unverified_claims_in_channel: Option<UnverifiedClaims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unverified_claims_for_name: Option<UnverifiedClaims>,
}

pub struct ClaimResolver {
    storage: SharedStorage,
    chain_client: SharedChainClient,
    uri_parser: Box<dyn UriParser>,
    claim_decoder: Box<dyn ClaimDecoder>,
}

impl ClaimResolver {
    pub fn new(
        storage: SharedStorage,
        chain_client: SharedChainClient,
        uri_parser: Box<dyn UriParser>,
        claim_decoder: Box<dyn ClaimDecoder>,
    ) -> Self {
        ClaimResolver {
            storage,
            chain_client,
            uri_parser,
            claim_decoder,
        }
    }

    /// `get_claim_info`: assembles a claim record from `Storage`, then
    /// enriches it with live `supports`/`effective_amount`/`valid_at_height`
    /// from the daemon's `getclaimsforname`. Returns `None` if any of the
    /// base fields are missing, matching the original returning `{}`.
    pub async fn get_claim_info(&self, claim_id: &str) -> ProcResult<Option<ClaimInfo>> {
        let name = self.storage.get_claim_name(claim_id).await?;
        let value = self.storage.get_claim_value(claim_id).await?;
        let outpoint = self.storage.get_outpoint_from_claim_id(claim_id).await?;
        let height = self.storage.get_claim_height(claim_id).await?;
        let address = self.storage.get_claim_address(claim_id).await?;

        let (Some(name), Some(value), Some((txid, nout)), Some(height), Some(address)) =
            (name, value, outpoint, height, address)
        else {
            return Ok(None);
        };
        let Some(claim_sequence) = self
            .storage
            .get_n_for_name_and_claimid(&name, claim_id)
            .await?
        else {
            return Ok(None);
        };

        let daemon_height = self.chain_client.get_info().await?.blocks;
        let amount = self.claim_amount(&txid, nout).await?;

        let mut info = ClaimInfo {
            name: name.clone(),
            claim_id: claim_id.to_string(),
            txid: txid.clone(),
            nout,
            amount,
            depth: daemon_height - height,
            height,
            value: hex::encode(&value),
            claim_sequence,
            address,
            supports: Vec::new(),
            effective_amount: None,
            valid_at_height: None,
        };

        let claims_for_name = self.chain_client.get_claims_for_name(&name).await?;
        if let Some(matching) = find_claim(&claims_for_name, claim_id, &txid, nout) {
            info.supports = extract_supports(matching);
            info.effective_amount = matching.get("nEffectiveAmount").and_then(Value::as_i64);
            info.valid_at_height = matching
                .get("nValidAtHeight")
                .and_then(Value::as_i64)
                .map(|v| v as i32);
        }
        Ok(Some(info))
    }

    /// `cmd_claimtrie_getvalue`: resolves the name's current winning claim,
    /// if any, via `getnameproof`.
    pub async fn get_value_for_name(
        &self,
        name: &str,
        block_hash: Option<&str>,
    ) -> ProcResult<ClaimValueResult> {
        let proof = self.chain_client.get_name_proof(name, block_hash).await?;

        let winning = if proof_has_winning_claim(&proof) {
            let txid = proof["txhash"].as_str().unwrap_or_default().to_string();
            let nout = proof["nOut"].as_u64().unwrap_or(0) as u32;
            let verbose = self.chain_client.get_raw_transaction_verbose(&txid).await?;
            let daemon_height = self.chain_client.get_info().await?.blocks;
            let transaction_height = daemon_height - verbose.confirmations.unwrap_or(0);
            Some((txid, nout, verbose.hex, transaction_height))
        } else {
            None
        };

        let mut result = ClaimValueResult {
            proof,
            transaction: None,
            height: None,
            claim_id: None,
            claim_sequence: None,
            supports: Vec::new(),
        };

        let Some((winning_txid, winning_nout, transaction_hex, transaction_height)) = winning
        else {
            return Ok(result);
        };
        result.transaction = Some(transaction_hex);
        result.height = Some(transaction_height + 1);

        let claims_for_name = self.chain_client.get_claims_for_name(name).await?;
        if let Some(claims) = claims_for_name.get("claims").and_then(Value::as_array) {
            for claim in claims {
                if claim.get("txid").and_then(Value::as_str) == Some(winning_txid.as_str())
                    && claim.get("n").and_then(Value::as_u64) == Some(winning_nout as u64)
                {
                    let claim_id = claim
                        .get("claimId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    result.claim_sequence = self
                        .storage
                        .get_n_for_name_and_claimid(name, &claim_id)
                        .await?;
                    result.supports = extract_supports(claim);
                    result.claim_id = Some(claim_id);
                    break;
                }
            }
        }
        Ok(result)
    }

    /// `get_signed_claims_with_name_for_channel`.
    pub async fn claims_signed_by_with_name(
        &self,
        channel_id: &str,
        name: &str,
    ) -> ProcResult<Vec<String>> {
        let mut matching = Vec::new();
        for claim in self.storage.get_claims_signed_by(channel_id).await? {
            if self.storage.get_claim_name(&claim.claim_id).await?.as_deref() == Some(name) {
                matching.push(claim.claim_id);
            }
        }
        Ok(matching)
    }

    async fn unverified_claims(&self, channel_id: &str) -> ProcResult<UnverifiedClaims> {
        let mut out = HashMap::new();
        for claim in self.storage.get_claims_signed_by(channel_id).await? {
            let name = self.storage.get_claim_name(&claim.claim_id).await?;
            let height = self.storage.get_claim_height(&claim.claim_id).await?;
            out.insert(claim.claim_id, (name, height));
        }
        Ok(out)
    }

    async fn unverified_claims_matching(
        &self,
        channel_id: &str,
        name: &str,
    ) -> ProcResult<UnverifiedClaims> {
        let mut out = HashMap::new();
        for claim_id in self.claims_signed_by_with_name(channel_id, name).await? {
            let claim_name = self.storage.get_claim_name(&claim_id).await?;
            let height = self.storage.get_claim_height(&claim_id).await?;
            out.insert(claim_id, (claim_name, height));
        }
        Ok(out)
    }

    /// `cmd_claimtrie_get_value_for_uri` — the core name-claim resolve
    /// algorithm. `cache` is the processor's short-term region, keyed by
    /// `block_hash + uri` exactly as the original keys its cache.
    pub async fn resolve(&self, cache: &Cache, block_hash: &str, uri: &str) -> ProcResult<UriResolution> {
        let cache_key = format!("{}{}", block_hash, uri);
        if let Some(cached) = cache.short_term.get::<UriResolution>(&cache_key) {
            return Ok(cached);
        }

        let parsed = match self.uri_parser.parse(uri) {
            Ok(p) => p,
            Err(e) => {
                return Ok(UriResolution {
                    error: Some(e.to_string()),
                    ..Default::default()
                })
            }
        };

        let mut result = UriResolution::default();

        if parsed.is_channel {
            let certificate = self.resolve_entry(&parsed, block_hash).await?;
            if let Some((certificate, channel_id)) = certificate {
                if parsed.path.is_none() {
                    result.unverified_claims_in_channel =
                        Some(self.unverified_claims(&channel_id).await?);
                } else {
                    let path = parsed.path.as_deref().unwrap_or_default();
                    result.unverified_claims_for_name =
                        Some(self.unverified_claims_matching(&channel_id, path).await?);
                }
                result.certificate = Some(certificate);
            }
        } else if let Some((claim, claim_id)) = self.resolve_entry(&parsed, block_hash).await? {
            result.claim = Some(claim.clone());
            if let Some(decoded) = self.decode_claim_value(&claim_id).await? {
                if let Some(certificate_id) = decoded.certificate_id {
                    if let Some(certificate_info) = self.get_claim_info(&certificate_id).await? {
                        result.certificate = Some(Resolved {
                            resolution_type: ResolutionType::ClaimId,
                            result: ResolvedResult::Claim(certificate_info),
                        });
                    }
                }
            }
        }

        cache.short_term.put(&cache_key, &result);
        Ok(result)
    }

    /// Resolves a certificate or claim entry by claim id, sequence number, or
    /// (falling through) the name's current winning claim, returning the
    /// resolved entry plus the claim id to key further lookups on.
    async fn resolve_entry(
        &self,
        parsed: &crate::uri::ParsedUri,
        block_hash: &str,
    ) -> ProcResult<Option<(Resolved, String)>> {
        if let Some(claim_id) = &parsed.claim_id {
            let Some(info) = self.get_claim_info(claim_id).await? else {
                return Ok(None);
            };
            if info.name != parsed.name {
                return Ok(None);
            }
            let claim_id = info.claim_id.clone();
            return Ok(Some((
                Resolved {
                    resolution_type: ResolutionType::ClaimId,
                    result: ResolvedResult::Claim(info),
                },
                claim_id,
            )));
        }
        if let Some(sequence) = parsed.claim_sequence {
            let Some(claim_id) = self
                .storage
                .get_claimid_for_nth_claim_to_name(&parsed.name, sequence)
                .await?
            else {
                return Ok(None);
            };
            let Some(info) = self.get_claim_info(&claim_id).await? else {
                return Ok(None);
            };
            return Ok(Some((
                Resolved {
                    resolution_type: ResolutionType::Sequence,
                    result: ResolvedResult::Claim(info),
                },
                claim_id,
            )));
        }

        let value = self.get_value_for_name(&parsed.name, Some(block_hash)).await?;
        if value.claim_id.is_none() && !proof_has_winning_claim(&value.proof) {
            return Ok(None);
        }
        let claim_id = value.claim_id.clone().unwrap_or_default();
        Ok(Some((
            Resolved {
                resolution_type: ResolutionType::Winning,
                result: ResolvedResult::Value(value),
            },
            claim_id,
        )))
    }

    /// Decodes a claim's stored value to look for a referenced certificate,
    /// matching `smart_decode(claim_val['value'])`.
    async fn decode_claim_value(&self, claim_id: &str) -> ProcResult<Option<crate::uri::DecodedClaim>> {
        let Some(value) = self.storage.get_claim_value(claim_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.claim_decoder.decode(&value)?))
    }

    async fn claim_amount(&self, txid: &str, nout: u32) -> ProcResult<i64> {
        let key = crate::types::Outpoint {
            txid: txid.to_string(),
            n: nout,
        }
        .to_key_bytes()
        .map_err(|e| crate::errors::ProcessorError::Decode(e.to_string()))?;
        Ok(self
            .storage
            .get_utxo_value(txid, &key)
            .await?
            .unwrap_or_default())
    }
}

fn find_claim<'a>(claims_for_name: &'a Value, claim_id: &str, txid: &str, nout: u32) -> Option<&'a Value> {
    claims_for_name
        .get("claims")
        .and_then(Value::as_array)?
        .iter()
        .find(|claim| {
            claim.get("claimId").and_then(Value::as_str) == Some(claim_id)
                && claim.get("txid").and_then(Value::as_str) == Some(txid)
                && claim.get("n").and_then(Value::as_u64) == Some(nout as u64)
        })
}

fn extract_supports(claim: &Value) -> Vec<(String, u32, i64)> {
    claim
        .get("supports")
        .and_then(Value::as_array)
        .map(|supports| {
            supports
                .iter()
                .filter_map(|support| {
                    let txid = support.get("txid")?.as_str()?.to_string();
                    let n = support.get("n")?.as_u64()? as u32;
                    let amount = support.get("nAmount")?.as_i64()?;
                    Some((txid, n, amount))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub type SharedClaimResolver = Arc<ClaimResolver>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn proof_without_winning_claim_is_recognized() {
        assert!(!proof_has_winning_claim(&json!({"some": "field"})));
        assert!(proof_has_winning_claim(&json!({"txhash": "abc", "nOut": 0})));
    }

    #[test]
    fn find_claim_matches_on_id_and_outpoint() {
        let claims = json!({
            "claims": [
                {"claimId": "c1", "txid": "t1", "n": 0},
                {"claimId": "c2", "txid": "t2", "n": 1},
            ]
        });
        let found = find_claim(&claims, "c2", "t2", 1);
        assert!(found.is_some());
        assert!(find_claim(&claims, "c2", "t1", 0).is_none());
    }

    #[test]
    fn extract_supports_reads_amount_fields() {
        let claim = json!({
            "supports": [{"txid": "s1", "n": 0, "nAmount": 500}]
        });
        let supports = extract_supports(&claim);
        assert_eq!(supports, vec![("s1".to_string(), 0, 500)]);
    }
}
