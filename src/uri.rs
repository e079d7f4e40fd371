/// Name-claim URI parsing and claim-value decoding (spec.md §4.7).
///
/// `UriParser` and `ClaimDecoder` are the external collaborators spec.md §1
/// calls out as out of scope: the original farms both out to an external
/// `ddcsschema` package not present in
/// `examples/original_source/ddcsumserver/` (only `blockchain_processor.py`
/// and `setup.py` are retrieved). `claim_resolver.rs` only needs the two
/// operations it actually calls on them (`parse_ddcs_uri` and
/// `smart_decode`'s certificate-id extraction), so this module defines that
/// boundary as traits with a concrete implementation good enough to drive
/// `blockchain.claimtrie.get_value_for_uri` end to end.
use crate::errors::{ProcResult, ProcessorError};

/// The parsed form of a name-claim URI, matching the fields
/// `cmd_claimtrie_get_value_for_uri` reads off the original's `parsed_uri`:
/// `is_channel`, `name`, `claim_id`, `claim_sequence`, and `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    pub name: String,
    pub is_channel: bool,
    pub claim_id: Option<String>,
    pub claim_sequence: Option<u32>,
    pub path: Option<String>,
}

pub trait UriParser: Send + Sync {
    fn parse(&self, uri: &str) -> ProcResult<ParsedUri>;
}

/// Parses `lbry://[@]name[#claim_id|:sequence][/path]`. A channel name
/// starts with `@`; a claim or channel may be pinned to a specific claim by
/// `#<hex claim id>` or to the Nth claim ever made against that name by
/// `:<sequence>`, but not both, matching how the original treats
/// `CLAIM_ID`/`SEQUENCE`/`WINNING` as mutually exclusive resolution types.
pub struct LbryUriParser;

impl UriParser for LbryUriParser {
    fn parse(&self, uri: &str) -> ProcResult<ParsedUri> {
        let body = uri.strip_prefix("lbry://").unwrap_or(uri);
        if body.is_empty() {
            return Err(ProcessorError::UriParse("empty uri".into()));
        }

        let (head, path) = match body.split_once('/') {
            Some((h, p)) => (h, Some(p.to_string())),
            None => (body, None),
        };
        if head.is_empty() {
            return Err(ProcessorError::UriParse(format!("no name in uri: {}", uri)));
        }

        let is_channel = head.starts_with('@');
        let unprefixed = if is_channel { &head[1..] } else { head };
        if unprefixed.is_empty() {
            return Err(ProcessorError::UriParse(format!(
                "channel uri missing name: {}",
                uri
            )));
        }

        let (name, claim_id, claim_sequence) = if let Some((n, id)) = unprefixed.split_once('#') {
            if n.is_empty() || id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ProcessorError::UriParse(format!(
                    "malformed claim id modifier: {}",
                    uri
                )));
            }
            (n.to_string(), Some(id.to_lowercase()), None)
        } else if let Some((n, seq)) = unprefixed.split_once(':') {
            let parsed_seq: u32 = seq
                .parse()
                .map_err(|_| ProcessorError::UriParse(format!("malformed sequence modifier: {}", uri)))?;
            if n.is_empty() {
                return Err(ProcessorError::UriParse(format!("no name in uri: {}", uri)));
            }
            (n.to_string(), None, Some(parsed_seq))
        } else {
            (unprefixed.to_string(), None, None)
        };

        Ok(ParsedUri {
            name,
            is_channel,
            claim_id,
            claim_sequence,
            path,
        })
    }
}

/// A claim value decoded far enough to drive channel-membership resolution:
/// just whether it carries a `certificate_id`, matching the one field
/// `cmd_claimtrie_get_value_for_uri` reads off `smart_decode(claim['value'])`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedClaim {
    pub certificate_id: Option<String>,
}

pub trait ClaimDecoder: Send + Sync {
    fn decode(&self, raw_value: &[u8]) -> ProcResult<DecodedClaim>;
}

/// Treats a claim value as `[0x01][32-byte certificate id]` for a
/// channel-signed claim, or anything else as unsigned. The real wire format
/// is the out-of-scope `ddcsschema` protobuf; this is a minimal stand-in
/// sufficient to exercise the signed-claim path in `claim_resolver.rs`.
pub struct TaggedCertificateDecoder;

const SIGNED_TAG: u8 = 0x01;
const CERTIFICATE_ID_LEN: usize = 32;

impl ClaimDecoder for TaggedCertificateDecoder {
    fn decode(&self, raw_value: &[u8]) -> ProcResult<DecodedClaim> {
        if raw_value.first() == Some(&SIGNED_TAG) && raw_value.len() >= 1 + CERTIFICATE_ID_LEN {
            let certificate_id = hex::encode(&raw_value[1..1 + CERTIFICATE_ID_LEN]);
            return Ok(DecodedClaim {
                certificate_id: Some(certificate_id),
            });
        }
        Ok(DecodedClaim::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name() {
        let parsed = LbryUriParser.parse("foo").unwrap();
        assert_eq!(parsed.name, "foo");
        assert!(!parsed.is_channel);
        assert_eq!(parsed.claim_id, None);
        assert_eq!(parsed.claim_sequence, None);
        assert_eq!(parsed.path, None);
    }

    #[test]
    fn parses_channel_with_claim_id_and_path() {
        let parsed = LbryUriParser
            .parse("lbry://@channel#ab12/some-video")
            .unwrap();
        assert!(parsed.is_channel);
        assert_eq!(parsed.name, "channel");
        assert_eq!(parsed.claim_id, Some("ab12".to_string()));
        assert_eq!(parsed.path, Some("some-video".to_string()));
    }

    #[test]
    fn parses_sequence_modifier() {
        let parsed = LbryUriParser.parse("foo:3").unwrap();
        assert_eq!(parsed.name, "foo");
        assert_eq!(parsed.claim_sequence, Some(3));
    }

    #[test]
    fn rejects_empty_uri() {
        assert!(LbryUriParser.parse("").is_err());
        assert!(LbryUriParser.parse("lbry://").is_err());
    }

    #[test]
    fn rejects_bare_channel_sigil() {
        assert!(LbryUriParser.parse("@").is_err());
    }

    #[test]
    fn decodes_signed_claim_certificate_id() {
        let mut value = vec![SIGNED_TAG];
        value.extend_from_slice(&[0xab; CERTIFICATE_ID_LEN]);
        let decoded = TaggedCertificateDecoder.decode(&value).unwrap();
        assert_eq!(decoded.certificate_id, Some("ab".repeat(CERTIFICATE_ID_LEN)));
    }

    #[test]
    fn unsigned_claim_has_no_certificate_id() {
        let decoded = TaggedCertificateDecoder.decode(&[0x00, 0x01, 0x02]).unwrap();
        assert_eq!(decoded.certificate_id, None);
    }
}
