//! Bilateral payment-channel plugin speaking the Bilateral Transfer Protocol
//! (BTP) between two Interledger peers over a persistent WebSocket.
//!
//! The plugin escrows conditional transfers (amounts released by revealing
//! the SHA-256 preimage of a condition before a deadline), keeps an
//! authoritative in-memory transfer log with directional balance bounds, and
//! correlates full-duplex BTP requests and responses over any number of
//! authenticated sockets to the same peer.

mod backend;
mod client;
mod custom_rpc;
mod errors;
mod events;
mod oer;
mod packet;
mod plugin;
mod protocol_map;
mod server;
mod service;
mod store;
mod transfer;
mod transfer_log;
mod util;

pub use self::backend::{BackendContext, NoopBackend, PaymentChannelBackend};
pub use self::client::{connect_client, parse_btp_url, BtpUri};
pub use self::custom_rpc::CustomRpcRegistry;
pub use self::errors::{
    ErrorClass, ErrorCode, ParseError, PluginError, RejectionReason, StoreError,
};
pub use self::events::{EventKind, PluginEvent, Subscription};
pub use self::packet::{
    BtpError, BtpFulfill, BtpMessage, BtpPacket, BtpPrepare, BtpReject, BtpResponse, ContentType,
    ProtocolData, Serializable,
};
pub use self::plugin::{Plugin, PluginOpts};
pub use self::protocol_map::{ProtocolMap, ProtocolValue};
pub use self::server::{start_listener, Listener, ListenerOpts};
pub use self::service::{
    AuthCheck, InboundRequest, Role, RpcEngine, DEFAULT_AUTH_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
pub use self::store::{MemoryStore, Store};
pub use self::transfer::{
    condition_from_fulfillment, decode_condition, decode_fulfillment, encode_condition,
    fulfillment_matches, Transfer, TransferRecord, TransferState,
};
pub use self::transfer_log::TransferLog;
pub use self::util::{base64url_decode, base64url_encode, random_token};
