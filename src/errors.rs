use std::str::Utf8Error;
use std::string::FromUtf8Error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Failure to decode a BTP envelope or one of its typed payloads.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unexpected end of packet while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("UTF-8 Error: {0}")]
    Utf8Err(#[from] Utf8Error),
    #[error("UTF-8 Conversion Error: {0}")]
    FromUtf8Err(#[from] FromUtf8Error),
    #[error("Chrono Error: {0}")]
    ChronoErr(#[from] chrono::ParseError),
    #[error("JSON Error: {0}")]
    JsonErr(#[from] serde_json::Error),
    #[error("Invalid Packet: {0}")]
    InvalidPacket(String),
}

/// Three-byte BTP error code. The first byte selects the class:
/// `T` temporary, `F` final, `R` relative.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ErrorCode([u8; 3]);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Final,
    Temporary,
    Relative,
    Unknown,
}

impl ErrorCode {
    #[inline]
    pub const fn new(bytes: [u8; 3]) -> Self {
        ErrorCode(bytes)
    }

    pub fn class(self) -> ErrorClass {
        match self.0[0] {
            b'F' => ErrorClass::Final,
            b'T' => ErrorClass::Temporary,
            b'R' => ErrorClass::Relative,
            _ => ErrorClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        // the constants below are all ASCII and unknown codes are checked on
        // construction
        std::str::from_utf8(&self.0[..]).unwrap_or("???")
    }

    pub const T00_UNREACHABLE: Self = ErrorCode(*b"T00");
    pub const F00_NOT_ACCEPTED: Self = ErrorCode(*b"F00");
    pub const F01_INVALID_FIELDS: Self = ErrorCode(*b"F01");
    pub const F02_TRANSFER_NOT_FOUND: Self = ErrorCode(*b"F02");
    pub const F03_INVALID_FULFILLMENT: Self = ErrorCode(*b"F03");
    pub const F04_DUPLICATE_ID: Self = ErrorCode(*b"F04");
    pub const F05_ALREADY_ROLLED_BACK: Self = ErrorCode(*b"F05");
    pub const F06_ALREADY_FULFILLED: Self = ErrorCode(*b"F06");
    pub const F07_INSUFFICIENT_BALANCE: Self = ErrorCode(*b"F07");
    pub const R00_TRANSFER_TIMED_OUT: Self = ErrorCode(*b"R00");
}

impl From<ErrorCode> for [u8; 3] {
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

/// A rejection reason travelling as the `ilp` sub-protocol of a REJECT frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectionReason {
    pub code: String,
    pub name: String,
    pub triggered_at: DateTime<Utc>,
    pub data: String,
}

impl RejectionReason {
    pub fn new(code: &str, name: &str, data: &str) -> Self {
        RejectionReason {
            code: code.to_string(),
            name: name.to_string(),
            triggered_at: Utc::now(),
            data: data.to_string(),
        }
    }

    /// The reason sent when a prepared outgoing transfer passes its deadline.
    pub fn timed_out() -> Self {
        RejectionReason::new("R00", "Transfer Timed Out", "expired")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Operation failure. Each variant corresponds to one entry of the BTP
/// error-name table so that handler failures can be mapped onto ERROR frames.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("not accepted: {0}")]
    NotAccepted(String),
    #[error("invalid fields: {0}")]
    InvalidFields(String),
    #[error("transfer not found: {0}")]
    TransferNotFound(Uuid),
    #[error("invalid fulfillment: {0}")]
    InvalidFulfillment(String),
    #[error("duplicate transfer id: {0}")]
    DuplicateId(Uuid),
    #[error("transfer already rolled back: {0}")]
    AlreadyRolledBack(Uuid),
    #[error("transfer already fulfilled: {0}")]
    AlreadyFulfilled(Uuid),
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("transfer timed out: {0}")]
    TransferTimedOut(String),
    /// An ERROR frame received from the peer in response to an outgoing
    /// request.
    #[error("peer error {code} {name}: {data}")]
    Remote {
        code: String,
        name: String,
        data: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl PluginError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PluginError::Unreachable(_) => ErrorCode::T00_UNREACHABLE,
            PluginError::NotAccepted(_) => ErrorCode::F00_NOT_ACCEPTED,
            PluginError::InvalidFields(_) => ErrorCode::F01_INVALID_FIELDS,
            PluginError::TransferNotFound(_) => ErrorCode::F02_TRANSFER_NOT_FOUND,
            PluginError::InvalidFulfillment(_) => ErrorCode::F03_INVALID_FULFILLMENT,
            PluginError::DuplicateId(_) => ErrorCode::F04_DUPLICATE_ID,
            PluginError::AlreadyRolledBack(_) => ErrorCode::F05_ALREADY_ROLLED_BACK,
            PluginError::AlreadyFulfilled(_) => ErrorCode::F06_ALREADY_FULFILLED,
            PluginError::InsufficientBalance(_) => ErrorCode::F07_INSUFFICIENT_BALANCE,
            PluginError::TransferTimedOut(_) => ErrorCode::R00_TRANSFER_TIMED_OUT,
            PluginError::Remote { code, .. } => {
                let mut bytes = [b'?'; 3];
                if code.len() == 3 && code.is_ascii() {
                    bytes.copy_from_slice(code.as_bytes());
                }
                ErrorCode::new(bytes)
            }
            // parse and store failures surface as refusals
            PluginError::Store(_) | PluginError::Parse(_) => ErrorCode::F00_NOT_ACCEPTED,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PluginError::Unreachable(_) => "UnreachableError",
            PluginError::NotAccepted(_) => "NotAcceptedError",
            PluginError::InvalidFields(_) => "InvalidFieldsError",
            PluginError::TransferNotFound(_) => "TransferNotFoundError",
            PluginError::InvalidFulfillment(_) => "InvalidFulfillmentError",
            PluginError::DuplicateId(_) => "DuplicateIdError",
            PluginError::AlreadyRolledBack(_) => "AlreadyRolledBackError",
            PluginError::AlreadyFulfilled(_) => "AlreadyFulfilledError",
            PluginError::InsufficientBalance(_) => "InsufficientBalanceError",
            PluginError::TransferTimedOut(_) => "TransferTimedOutError",
            PluginError::Remote { name, .. } => name,
            PluginError::Store(_) | PluginError::Parse(_) => "NotAcceptedError",
        }
    }

    /// The `data` field carried in an ERROR frame built from this failure.
    pub fn frame_data(&self) -> String {
        serde_json::json!({ "message": self.to_string() }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_classes() {
        assert_eq!(ErrorCode::F00_NOT_ACCEPTED.class(), ErrorClass::Final);
        assert_eq!(ErrorCode::T00_UNREACHABLE.class(), ErrorClass::Temporary);
        assert_eq!(
            ErrorCode::R00_TRANSFER_TIMED_OUT.class(),
            ErrorClass::Relative
        );
        assert_eq!(ErrorCode::new(*b"???").class(), ErrorClass::Unknown);
    }

    #[test]
    fn error_name_table() {
        let id = Uuid::nil();
        let cases: Vec<(PluginError, &str, &str)> = vec![
            (
                PluginError::Unreachable("x".to_string()),
                "T00",
                "UnreachableError",
            ),
            (
                PluginError::NotAccepted("x".to_string()),
                "F00",
                "NotAcceptedError",
            ),
            (
                PluginError::InvalidFields("x".to_string()),
                "F01",
                "InvalidFieldsError",
            ),
            (
                PluginError::TransferNotFound(id),
                "F02",
                "TransferNotFoundError",
            ),
            (
                PluginError::InvalidFulfillment("x".to_string()),
                "F03",
                "InvalidFulfillmentError",
            ),
            (PluginError::DuplicateId(id), "F04", "DuplicateIdError"),
            (
                PluginError::AlreadyRolledBack(id),
                "F05",
                "AlreadyRolledBackError",
            ),
            (
                PluginError::AlreadyFulfilled(id),
                "F06",
                "AlreadyFulfilledError",
            ),
            (
                PluginError::InsufficientBalance("x".to_string()),
                "F07",
                "InsufficientBalanceError",
            ),
        ];
        for (error, code, name) in cases {
            assert_eq!(error.code().as_str(), code);
            assert_eq!(error.name(), name);
        }
    }

    #[test]
    fn frame_data_is_json() {
        let error = PluginError::NotAccepted("over the line".to_string());
        let value: serde_json::Value = serde_json::from_str(&error.frame_data()).unwrap();
        assert_eq!(value["message"], "not accepted: over the line");
    }
}
