use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PluginError;
use crate::protocol_map::ProtocolValue;
use crate::util::{base64url_decode, base64url_encode};

/// A conditional obligation between the two peers: escrowed until the
/// preimage of `execution_condition` is revealed or `expires_at` passes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    /// Non-negative decimal string.
    pub amount: String,
    #[serde(with = "crate::util::b64_bytes32")]
    pub execution_condition: [u8; 32],
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::util::b64_opt_bytes")]
    pub ilp: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, ProtocolValue>,
    pub from: String,
    pub to: String,
    pub ledger: String,
}

impl Transfer {
    /// Parses the amount, rejecting signs, fractions and anything else that
    /// is not a plain decimal integer.
    pub fn parsed_amount(&self) -> Result<u64, PluginError> {
        if self.amount.is_empty() || !self.amount.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PluginError::InvalidFields(format!(
                "amount must be a non-negative decimal string, got {:?}",
                self.amount
            )));
        }
        self.amount
            .parse::<u64>()
            .map_err(|_| PluginError::InvalidFields(format!("amount out of range: {}", self.amount)))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Prepared,
    Fulfilled,
    Cancelled,
}

/// Ledger-internal record of a transfer and its lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer: Transfer,
    pub is_incoming: bool,
    pub state: TransferState,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::util::b64_opt_bytes32"
    )]
    pub fulfillment: Option<[u8; 32]>,
}

impl TransferRecord {
    pub fn new(transfer: Transfer, is_incoming: bool) -> Self {
        TransferRecord {
            transfer,
            is_incoming,
            state: TransferState::Prepared,
            fulfillment: None,
        }
    }
}

/// Decodes a base64url condition, which must be exactly 32 bytes.
pub fn decode_condition(encoded: &str) -> Result<[u8; 32], PluginError> {
    decode_32_bytes(encoded)
        .ok_or_else(|| PluginError::InvalidFields(format!("invalid condition: {:?}", encoded)))
}

/// Decodes a base64url fulfillment, which must be exactly 32 bytes.
pub fn decode_fulfillment(encoded: &str) -> Result<[u8; 32], PluginError> {
    decode_32_bytes(encoded)
        .ok_or_else(|| PluginError::InvalidFulfillment(format!("invalid fulfillment: {:?}", encoded)))
}

fn decode_32_bytes(encoded: &str) -> Option<[u8; 32]> {
    let bytes = base64url_decode(encoded).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

pub fn encode_condition(condition: &[u8; 32]) -> String {
    base64url_encode(condition)
}

/// SHA-256 of the fulfillment, which a matching condition must equal
/// byte-for-byte.
pub fn condition_from_fulfillment(fulfillment: &[u8; 32]) -> [u8; 32] {
    let hash = digest::digest(&digest::SHA256, fulfillment);
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_ref());
    out
}

pub fn fulfillment_matches(fulfillment: &[u8; 32], condition: &[u8; 32]) -> bool {
    condition_from_fulfillment(fulfillment) == *condition
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(amount: &str) -> Transfer {
        Transfer {
            id: Uuid::new_v4(),
            amount: amount.to_string(),
            execution_condition: [0; 32],
            expires_at: Utc::now() + chrono::Duration::seconds(30),
            ilp: None,
            custom: BTreeMap::new(),
            from: "peer.alice.client".to_string(),
            to: "peer.alice.server".to_string(),
            ledger: "peer.alice.".to_string(),
        }
    }

    #[test]
    fn parses_plain_decimal_amounts() {
        assert_eq!(transfer("0").parsed_amount().unwrap(), 0);
        assert_eq!(transfer("5").parsed_amount().unwrap(), 5);
        assert_eq!(transfer("1000000").parsed_amount().unwrap(), 1_000_000);
    }

    #[test]
    fn rejects_bad_amounts() {
        for bad in ["", "-5", "+5", "1.5", "10 ", "1e3", "ten"] {
            assert!(transfer(bad).parsed_amount().is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn condition_closes_over_fulfillment() {
        // the fulfillment from the protocol test vectors
        let fulfillment =
            decode_fulfillment("gHJ2QeIZpstXaGZVCSq4d3vkrMSChNYKriefys3KMtI").unwrap();
        let condition = condition_from_fulfillment(&fulfillment);
        assert!(fulfillment_matches(&fulfillment, &condition));
        assert!(!fulfillment_matches(&[0u8; 32], &condition));
    }

    #[test]
    fn garbage_fulfillment_is_rejected() {
        assert!(decode_fulfillment("Garbage").is_err());
        // valid base64url but the wrong length
        assert!(decode_fulfillment("aGVsbG8").is_err());
    }

    #[test]
    fn record_starts_prepared() {
        let record = TransferRecord::new(transfer("5"), true);
        assert_eq!(record.state, TransferState::Prepared);
        assert!(record.fulfillment.is_none());
    }

    #[test]
    fn records_roundtrip_through_json() {
        let mut record = TransferRecord::new(transfer("5"), false);
        record.transfer.ilp = Some(vec![1, 2, 3]);
        record.transfer.custom.insert(
            "memo".to_string(),
            ProtocolValue::Text("hi".to_string()),
        );
        record.state = TransferState::Fulfilled;
        record.fulfillment = Some([7u8; 32]);

        let json = serde_json::to_string(&record).unwrap();
        let back: TransferRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let mut t = transfer("5");
        let now = Utc::now();
        t.expires_at = now;
        assert!(t.is_expired(now));
        assert!(!t.is_expired(now - chrono::Duration::milliseconds(1)));
    }
}
