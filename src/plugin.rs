use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{BackendContext, NoopBackend, PaymentChannelBackend};
use crate::client::connect_client;
use crate::custom_rpc::CustomRpcRegistry;
use crate::errors::{PluginError, RejectionReason};
use crate::events::{EventDispatcher, EventKind, PluginEvent, Subscription};
use crate::packet::{
    BtpFulfill, BtpMessage, BtpPacket, BtpPrepare, BtpReject, ProtocolData,
};
use crate::protocol_map::{ProtocolMap, ProtocolValue};
use crate::server::{start_listener, Listener, ListenerOpts};
use crate::service::{AuthCheck, InboundRequest, RpcEngine, DEFAULT_REQUEST_TIMEOUT};
use crate::store::Store;
use crate::transfer::{
    decode_fulfillment, fulfillment_matches, Transfer, TransferRecord, TransferState,
};
use crate::transfer_log::TransferLog;

/// Plugin configuration. Exactly one of `server` (client mode) or `listener`
/// (server mode) must be set.
pub struct PluginOpts {
    /// BTP URI of the peer to dial, `btp+ws(s)://user:token@host[:port]`.
    pub server: Option<String>,
    pub listener: Option<ListenerOpts>,
    /// Ledger prefix; also scopes the persisted keys.
    pub prefix: String,
    /// Extra fields returned by the `info` side protocol.
    pub info: serde_json::Value,
    /// Decimal bound on the incoming prepared-and-fulfilled balance.
    pub max_balance: Option<String>,
    /// Decimal bound (usually negative) on the outgoing side.
    pub min_balance: Option<String>,
    /// Validator for credentials presented by inbound sockets.
    pub auth: AuthCheck,
    pub store: Option<Arc<dyn Store>>,
}

impl PluginOpts {
    pub fn client(prefix: &str, server: &str) -> Self {
        PluginOpts {
            server: Some(server.to_string()),
            listener: None,
            prefix: prefix.to_string(),
            info: serde_json::Value::Null,
            max_balance: None,
            min_balance: None,
            auth: AuthCheck::Token(String::new()),
            store: None,
        }
    }

    pub fn server(prefix: &str, listener: ListenerOpts, incoming_secret: &str) -> Self {
        PluginOpts {
            server: None,
            listener: Some(listener),
            prefix: prefix.to_string(),
            info: serde_json::Value::Null,
            max_balance: None,
            min_balance: None,
            auth: AuthCheck::Token(incoming_secret.to_string()),
            store: None,
        }
    }
}

struct ConnectionState {
    connected: bool,
    listener: Option<Listener>,
    dispatch_task: Option<JoinHandle<()>>,
}

struct PluginInner {
    prefix: String,
    info: serde_json::Value,
    server_uri: Option<String>,
    listener_opts: Option<ListenerOpts>,
    auth: AuthCheck,
    account: String,
    peer_account: String,
    engine: RpcEngine,
    log: TransferLog,
    backend: Arc<dyn PaymentChannelBackend>,
    events: EventDispatcher,
    rpc: CustomRpcRegistry,
    conn: Mutex<ConnectionState>,
    self_ref: Mutex<Weak<PluginInner>>,
}

/// A bilateral payment-channel plugin: one instance, two peers, one
/// WebSocket between them (or several, all authenticated to the same peer).
///
/// The plugin escrows conditional transfers in its transfer log, releases
/// them against SHA-256 preimages before their deadlines and reclaims them
/// on expiry. Lifecycle notifications are delivered through the `on_*`
/// subscription methods. A plugin instance connects once; after
/// `disconnect` a new instance must be created.
#[derive(Clone)]
pub struct Plugin {
    inner: Arc<PluginInner>,
}

impl Plugin {
    pub fn new(opts: PluginOpts) -> Result<Self, PluginError> {
        Plugin::with_backend(opts, Arc::new(NoopBackend))
    }

    pub fn with_backend(
        opts: PluginOpts,
        backend: Arc<dyn PaymentChannelBackend>,
    ) -> Result<Self, PluginError> {
        if opts.server.is_some() && opts.listener.is_some() {
            return Err(PluginError::InvalidFields(
                "configure either a server URI or a listener, not both".to_string(),
            ));
        }
        if opts.server.is_none() && opts.listener.is_none() {
            return Err(PluginError::InvalidFields(
                "either a server URI or a listener must be configured".to_string(),
            ));
        }
        let maximum = parse_bound(opts.max_balance.as_deref(), i64::MAX)?;
        let minimum = parse_bound(opts.min_balance.as_deref(), i64::MIN)?;

        // the dialing side is addressed as client, the listening side as
        // server
        let (account, peer_account) = if opts.server.is_some() {
            (
                format!("{}client", opts.prefix),
                format!("{}server", opts.prefix),
            )
        } else {
            (
                format!("{}server", opts.prefix),
                format!("{}client", opts.prefix),
            )
        };

        let log = TransferLog::new(&opts.prefix, maximum, minimum, opts.store.clone());
        let inner = Arc::new(PluginInner {
            prefix: opts.prefix,
            info: opts.info,
            server_uri: opts.server,
            listener_opts: opts.listener,
            auth: opts.auth,
            account,
            peer_account,
            engine: RpcEngine::new(DEFAULT_REQUEST_TIMEOUT),
            log,
            backend,
            events: EventDispatcher::new(),
            rpc: CustomRpcRegistry::new(),
            conn: Mutex::new(ConnectionState {
                connected: false,
                listener: None,
                dispatch_task: None,
            }),
            self_ref: Mutex::new(Weak::new()),
        });
        *inner.self_ref.lock() = Arc::downgrade(&inner);
        Ok(Plugin { inner })
    }

    /// Rehydrates the transfer log, connects the payment-channel backend and
    /// brings up the configured transport (dialing out or listening).
    pub async fn connect(&self) -> Result<(), PluginError> {
        if self.inner.conn.lock().connected {
            return Ok(());
        }
        self.inner.log.load().await?;
        let ctx = self.inner.backend_context();
        self.inner.backend.connect(&ctx).await?;

        let receiver = self.inner.engine.take_incoming().ok_or_else(|| {
            PluginError::InvalidFields(
                "plugin instances cannot reconnect; create a new one".to_string(),
            )
        })?;
        let weak = self.inner.self_ref.lock().clone();
        let dispatch_task = tokio::spawn(async move {
            let mut receiver = receiver;
            while let Some(request) = receiver.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.handle_inbound(request).await,
                    None => break,
                }
            }
            trace!("inbound dispatch finished");
        });

        let result = if let Some(uri) = &self.inner.server_uri {
            connect_client(&self.inner.engine, uri).await.map(|_| None)
        } else if let Some(opts) = &self.inner.listener_opts {
            start_listener(opts, self.inner.engine.clone(), self.inner.auth.clone())
                .await
                .map(Some)
        } else {
            Err(PluginError::InvalidFields(
                "either a server URI or a listener must be configured".to_string(),
            ))
        };

        match result {
            Ok(listener) => {
                let mut conn = self.inner.conn.lock();
                conn.connected = true;
                conn.listener = listener;
                conn.dispatch_task = Some(dispatch_task);
                debug!("plugin connected as {}", self.inner.account);
                Ok(())
            }
            Err(err) => {
                dispatch_task.abort();
                Err(err)
            }
        }
    }

    /// Closes every socket, fails all in-flight requests with a uniform
    /// connection-closed error, drains the store write queue and disconnects
    /// the backend.
    pub async fn disconnect(&self) -> Result<(), PluginError> {
        let (listener, dispatch_task) = {
            let mut conn = self.inner.conn.lock();
            if !conn.connected {
                return Ok(());
            }
            conn.connected = false;
            (conn.listener.take(), conn.dispatch_task.take())
        };
        if let Some(listener) = listener {
            listener.shutdown();
        }
        self.inner.engine.close();
        if let Some(dispatch_task) = dispatch_task {
            dispatch_task.abort();
        }
        self.inner.log.close().await;
        self.inner.backend.disconnect().await?;
        debug!("plugin disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.conn.lock().connected && self.inner.engine.num_connections() > 0
    }

    /// Local address of the listener, if this plugin is in server mode and
    /// connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .conn
            .lock()
            .listener
            .as_ref()
            .map(|listener| listener.local_addr())
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn account(&self) -> &str {
        &self.inner.account
    }

    pub fn peer_account(&self) -> &str {
        &self.inner.peer_account
    }

    pub fn get_info(&self) -> serde_json::Value {
        self.inner.info_payload()
    }

    /// Visible balance: incoming fulfilled minus outgoing fulfilled,
    /// stringified.
    pub fn get_balance(&self) -> String {
        self.inner.log.balance().to_string()
    }

    /// Escrows an outgoing transfer locally, then announces it to the peer.
    /// Resolves when the peer acknowledges the PREPARE; fulfillment arrives
    /// later through `on_outgoing_fulfill`. If the peer refuses, the local
    /// reservation stays until the expiry timer reclaims it.
    pub async fn send_transfer(&self, transfer: Transfer) -> Result<(), PluginError> {
        let inner = &self.inner;
        let amount = transfer.parsed_amount()?;
        if transfer.from != inner.account {
            return Err(PluginError::InvalidFields(format!(
                "transfer.from must be {}, got {}",
                inner.account, transfer.from
            )));
        }
        if transfer.to != inner.peer_account {
            return Err(PluginError::InvalidFields(format!(
                "transfer.to must be {}, got {}",
                inner.peer_account, transfer.to
            )));
        }
        if transfer.ledger != inner.prefix {
            return Err(PluginError::InvalidFields(format!(
                "transfer.ledger must be {}, got {}",
                inner.prefix, transfer.ledger
            )));
        }

        // local first, so peer events about this id cannot race the record
        inner.log.prepare(&transfer, false).await?;
        inner.schedule_expiry(transfer.id, transfer.expires_at);

        let parts = ProtocolMap {
            ilp: transfer.ilp.clone(),
            custom: transfer.custom.clone(),
            map: BTreeMap::new(),
            primary: None,
        }
        .to_parts();
        inner
            .engine
            .request(|request_id| {
                BtpPacket::Prepare(BtpPrepare {
                    request_id,
                    transfer_id: transfer.id,
                    amount,
                    execution_condition: transfer.execution_condition,
                    expires_at: transfer.expires_at,
                    protocol_data: parts,
                })
            })
            .await?;

        inner.events.emit(PluginEvent::OutgoingPrepare(transfer));
        Ok(())
    }

    /// Releases an incoming escrow by revealing the preimage of its
    /// condition, then announces the FULFILL to the peer. Any `claim` part in
    /// the peer's acknowledgement is forwarded to the backend.
    pub async fn fulfill_condition(
        &self,
        id: Uuid,
        fulfillment: &str,
    ) -> Result<(), PluginError> {
        let inner = &self.inner;
        let fulfillment = decode_fulfillment(fulfillment)?;

        let record = inner.log.get(id).await?;
        if !record.is_incoming {
            return Err(PluginError::InvalidFields(format!(
                "transfer {} is not incoming",
                id
            )));
        }
        require_prepared(&record, id)?;
        if record.transfer.is_expired(Utc::now()) {
            return Err(PluginError::TransferTimedOut(format!(
                "transfer {} has already expired",
                id
            )));
        }
        if !fulfillment_matches(&fulfillment, &record.transfer.execution_condition) {
            return Err(PluginError::NotAccepted(
                "fulfillment does not match the condition".to_string(),
            ));
        }

        let record = inner.log.fulfill(id, fulfillment).await?;
        inner
            .events
            .emit(PluginEvent::IncomingFulfill(record.transfer, fulfillment));

        let response = inner
            .engine
            .request(|request_id| {
                BtpPacket::Fulfill(BtpFulfill {
                    request_id,
                    transfer_id: id,
                    fulfillment,
                    protocol_data: Vec::new(),
                })
            })
            .await?;

        let view = ProtocolMap::from_parts(&response)?;
        if let Some(ProtocolValue::Json(claim)) = view.map.get("claim") {
            let ctx = inner.backend_context();
            inner
                .backend
                .handle_incoming_claim(&ctx, claim.clone())
                .await?;
        }
        Ok(())
    }

    /// Refuses an incoming escrow, sending the reason to the peer as the
    /// `ilp` sub-protocol of a REJECT.
    pub async fn reject_incoming_transfer(
        &self,
        id: Uuid,
        reason: RejectionReason,
    ) -> Result<(), PluginError> {
        let inner = &self.inner;
        let record = inner.log.get(id).await?;
        if !record.is_incoming {
            return Err(PluginError::InvalidFields(format!(
                "transfer {} is not incoming",
                id
            )));
        }

        let record = inner.log.cancel(id).await?;
        inner
            .events
            .emit(PluginEvent::IncomingReject(record.transfer, reason.clone()));

        let parts = rejection_parts(&reason)?;
        inner
            .engine
            .request(|request_id| {
                BtpPacket::Reject(BtpReject {
                    request_id,
                    transfer_id: id,
                    protocol_data: parts,
                })
            })
            .await?;
        Ok(())
    }

    /// Sends a MESSAGE carrying arbitrary sub-protocols and returns the
    /// peer's response as a structured view.
    pub async fn send_request(&self, request: ProtocolMap) -> Result<ProtocolMap, PluginError> {
        let parts = request.to_parts();
        let response = self
            .inner
            .engine
            .request(|request_id| {
                BtpPacket::Message(BtpMessage {
                    request_id,
                    protocol_data: parts,
                })
            })
            .await?;
        Ok(ProtocolMap::from_parts(&response)?)
    }

    /// Asks the peer for the maximum it will let us owe (its `limit` side
    /// protocol).
    pub async fn get_limit(&self) -> Result<String, PluginError> {
        let response = self
            .inner
            .engine
            .request(|request_id| {
                BtpPacket::Message(BtpMessage {
                    request_id,
                    protocol_data: vec![ProtocolData::octet_stream("limit", Vec::new())],
                })
            })
            .await?;
        let view = ProtocolMap::from_parts(&response)?;
        match view.map.get("limit") {
            Some(ProtocolValue::Json(serde_json::Value::String(limit))) => Ok(limit.clone()),
            Some(ProtocolValue::Json(value)) => Ok(value.to_string()),
            _ => Err(PluginError::InvalidFields(
                "peer returned no limit".to_string(),
            )),
        }
    }

    /// Asks the peer for its visible balance (an 8-byte big-endian signed
    /// integer on the wire).
    pub async fn get_peer_balance(&self) -> Result<i64, PluginError> {
        let response = self
            .inner
            .engine
            .request(|request_id| {
                BtpPacket::Message(BtpMessage {
                    request_id,
                    protocol_data: vec![ProtocolData::octet_stream("balance", Vec::new())],
                })
            })
            .await?;
        let view = ProtocolMap::from_parts(&response)?;
        match view.map.get("balance") {
            Some(ProtocolValue::Binary(bytes)) if bytes.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                Ok(i64::from_be_bytes(raw))
            }
            _ => Err(PluginError::InvalidFields(
                "peer returned no balance".to_string(),
            )),
        }
    }

    /// Registers a handler answering MESSAGE frames whose primary protocol
    /// is `protocol`. The handler gets the part decoded as JSON and returns
    /// the JSON to send back under the same name.
    pub fn register_request_handler<F, Fut>(&self, protocol: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, PluginError>> + Send + 'static,
    {
        self.inner.rpc.register(protocol, handler);
    }

    pub fn unregister_request_handler(&self, protocol: &str) -> bool {
        self.inner.rpc.unregister(protocol)
    }

    pub fn on_incoming_prepare<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(EventKind::IncomingPrepare, move |event| {
                if let PluginEvent::IncomingPrepare(transfer) = event {
                    observer(transfer)
                }
            })
    }

    pub fn on_incoming_fulfill<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Transfer, &[u8; 32]) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(EventKind::IncomingFulfill, move |event| {
                if let PluginEvent::IncomingFulfill(transfer, fulfillment) = event {
                    observer(transfer, fulfillment)
                }
            })
    }

    pub fn on_incoming_reject<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Transfer, &RejectionReason) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(EventKind::IncomingReject, move |event| {
                if let PluginEvent::IncomingReject(transfer, reason) = event {
                    observer(transfer, reason)
                }
            })
    }

    pub fn on_incoming_cancel<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(EventKind::IncomingCancel, move |event| {
                if let PluginEvent::IncomingCancel(transfer) = event {
                    observer(transfer)
                }
            })
    }

    pub fn on_outgoing_prepare<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(EventKind::OutgoingPrepare, move |event| {
                if let PluginEvent::OutgoingPrepare(transfer) = event {
                    observer(transfer)
                }
            })
    }

    pub fn on_outgoing_fulfill<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Transfer, &[u8; 32]) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(EventKind::OutgoingFulfill, move |event| {
                if let PluginEvent::OutgoingFulfill(transfer, fulfillment) = event {
                    observer(transfer, fulfillment)
                }
            })
    }

    pub fn on_outgoing_reject<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Transfer, &RejectionReason) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(EventKind::OutgoingReject, move |event| {
                if let PluginEvent::OutgoingReject(transfer, reason) = event {
                    observer(transfer, reason)
                }
            })
    }

    pub fn on_outgoing_cancel<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Transfer) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(EventKind::OutgoingCancel, move |event| {
                if let PluginEvent::OutgoingCancel(transfer) = event {
                    observer(transfer)
                }
            })
    }
}

impl PluginInner {
    fn backend_context(&self) -> BackendContext {
        BackendContext::new(
            self.prefix.clone(),
            self.account.clone(),
            self.peer_account.clone(),
            self.log.clone(),
        )
    }

    fn info_payload(&self) -> serde_json::Value {
        let mut object = match &self.info {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        object.insert("prefix".to_string(), self.prefix.clone().into());
        object.insert("account".to_string(), self.account.clone().into());
        serde_json::Value::Object(object)
    }

    async fn handle_inbound(&self, request: InboundRequest) {
        let InboundRequest { slot, packet } = request;
        let request_id = packet.request_id();
        let result = match packet {
            BtpPacket::Prepare(prepare) => self.handle_incoming_prepare(prepare).await,
            BtpPacket::Fulfill(fulfill) => self.handle_incoming_fulfill(fulfill).await,
            BtpPacket::Reject(reject) => self.handle_incoming_reject(reject).await,
            BtpPacket::Message(message) => self.handle_incoming_message(message).await,
            BtpPacket::Response(_) | BtpPacket::Error(_) => {
                warn!("response frame leaked into the inbound queue");
                return;
            }
        };
        match result {
            Ok(protocol_data) => self.engine.respond(slot, request_id, Ok(protocol_data)),
            Err(err) => {
                self.engine.respond(slot, request_id, Err(&err));
                error!("handler for request {} failed: {}", request_id, err);
            }
        }
    }

    /// PREPARE from the peer: escrow an incoming transfer.
    async fn handle_incoming_prepare(
        &self,
        prepare: BtpPrepare,
    ) -> Result<Vec<ProtocolData>, PluginError> {
        let view = ProtocolMap::from_parts(&prepare.protocol_data)?;
        let transfer = Transfer {
            id: prepare.transfer_id,
            amount: prepare.amount.to_string(),
            execution_condition: prepare.execution_condition,
            expires_at: prepare.expires_at,
            ilp: view.ilp,
            custom: view.custom,
            from: self.peer_account.clone(),
            to: self.account.clone(),
            ledger: self.prefix.clone(),
        };

        self.log.prepare(&transfer, true).await?;

        let ctx = self.backend_context();
        if let Err(err) = self
            .backend
            .handle_incoming_prepare(&ctx, &transfer)
            .await
        {
            // undo the reservation; the peer gets the backend's refusal
            if let Err(cancel_err) = self.log.cancel(transfer.id).await {
                error!(
                    "cannot cancel transfer {} refused by the backend: {}",
                    transfer.id, cancel_err
                );
            }
            return Err(err);
        }

        self.events
            .emit(PluginEvent::IncomingPrepare(transfer.clone()));
        self.schedule_expiry(transfer.id, transfer.expires_at);
        Ok(Vec::new())
    }

    /// FULFILL from the peer: one of our outgoing escrows has been released.
    async fn handle_incoming_fulfill(
        &self,
        fulfill: BtpFulfill,
    ) -> Result<Vec<ProtocolData>, PluginError> {
        let id = fulfill.transfer_id;
        let record = self.log.get(id).await?;
        if record.is_incoming {
            return Err(PluginError::InvalidFields(format!(
                "transfer {} is not outgoing",
                id
            )));
        }
        require_prepared(&record, id)?;
        if record.transfer.is_expired(Utc::now()) {
            return Err(PluginError::TransferTimedOut(format!(
                "transfer {} has already expired",
                id
            )));
        }
        if !fulfillment_matches(&fulfill.fulfillment, &record.transfer.execution_condition) {
            return Err(PluginError::NotAccepted(
                "fulfillment does not match the condition".to_string(),
            ));
        }

        let record = self.log.fulfill(id, fulfill.fulfillment).await?;
        self.events.emit(PluginEvent::OutgoingFulfill(
            record.transfer,
            fulfill.fulfillment,
        ));

        let ctx = self.backend_context();
        let claim = self
            .backend
            .create_outgoing_claim(&ctx, self.log.outgoing_fulfilled())
            .await?;
        let mut protocol_data = Vec::new();
        if let Some(claim) = claim {
            protocol_data.push(ProtocolData::json("claim", &claim));
        }
        Ok(protocol_data)
    }

    /// REJECT from the peer. For our outgoing transfers this is a refusal;
    /// for incoming ones it means the sender rescinded an expired escrow.
    async fn handle_incoming_reject(
        &self,
        reject: BtpReject,
    ) -> Result<Vec<ProtocolData>, PluginError> {
        let view = ProtocolMap::from_parts(&reject.protocol_data)?;
        let reason = view
            .ilp
            .as_deref()
            .and_then(|ilp| serde_json::from_slice::<RejectionReason>(ilp).ok())
            .unwrap_or_else(|| {
                RejectionReason::new("F00", "NotAcceptedError", "rejected by peer")
            });

        let record = match self.log.cancel(reject.transfer_id).await {
            Ok(record) => record,
            // both expiry timers racing each other is expected
            Err(PluginError::AlreadyRolledBack(_)) => {
                trace!("transfer {} was already cancelled", reject.transfer_id);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        if record.is_incoming {
            self.events
                .emit(PluginEvent::IncomingCancel(record.transfer));
        } else {
            self.events
                .emit(PluginEvent::OutgoingReject(record.transfer, reason));
        }
        Ok(Vec::new())
    }

    /// MESSAGE: side-protocol dispatch by primary protocol name.
    async fn handle_incoming_message(
        &self,
        message: BtpMessage,
    ) -> Result<Vec<ProtocolData>, PluginError> {
        let view = ProtocolMap::from_parts(&message.protocol_data)?;
        match view.primary.as_deref() {
            Some("info") => Ok(vec![ProtocolData::json("info", &self.info_payload())]),
            Some("balance") => Ok(vec![ProtocolData::octet_stream(
                "balance",
                self.log.balance().to_be_bytes().to_vec(),
            )]),
            Some("limit") => Ok(vec![ProtocolData::json(
                "limit",
                &serde_json::Value::String(self.log.maximum().to_string()),
            )]),
            _ => self.rpc.handle(&view).await,
        }
    }

    fn schedule_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) {
        let weak = self.self_ref.lock().clone();
        tokio::spawn(async move {
            let delay = (expires_at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(id).await;
            }
        });
    }

    /// Expiry timer fired: reclaim the escrow if it is still prepared. For
    /// outgoing transfers the peer is told with a REJECT carrying the
    /// timeout reason.
    async fn expire(&self, id: Uuid) {
        let record = match self.log.cancel(id).await {
            Ok(record) => record,
            Err(PluginError::TransferNotFound(_))
            | Err(PluginError::AlreadyFulfilled(_))
            | Err(PluginError::AlreadyRolledBack(_)) => return,
            Err(err) => {
                warn!("cannot cancel expired transfer {}: {}", id, err);
                return;
            }
        };
        debug!(
            "transfer {} expired while prepared, reclaiming {}",
            id, record.transfer.amount
        );

        if record.is_incoming {
            self.events
                .emit(PluginEvent::IncomingCancel(record.transfer));
        } else {
            let reason = RejectionReason::timed_out();
            match rejection_parts(&reason) {
                Ok(parts) => {
                    if let Err(err) = self
                        .engine
                        .request(|request_id| {
                            BtpPacket::Reject(BtpReject {
                                request_id,
                                transfer_id: id,
                                protocol_data: parts,
                            })
                        })
                        .await
                    {
                        warn!("peer did not acknowledge expiry of {}: {}", id, err);
                    }
                }
                Err(err) => warn!("cannot encode expiry reason for {}: {}", id, err),
            }
            self.events
                .emit(PluginEvent::OutgoingCancel(record.transfer));
        }
    }
}

fn rejection_parts(reason: &RejectionReason) -> Result<Vec<ProtocolData>, PluginError> {
    let bytes = serde_json::to_vec(reason)
        .map_err(|err| PluginError::InvalidFields(format!("cannot encode reason: {}", err)))?;
    Ok(vec![ProtocolData::octet_stream("ilp", bytes)])
}

fn require_prepared(record: &TransferRecord, id: Uuid) -> Result<(), PluginError> {
    match record.state {
        TransferState::Prepared => Ok(()),
        TransferState::Fulfilled => Err(PluginError::AlreadyFulfilled(id)),
        TransferState::Cancelled => Err(PluginError::AlreadyRolledBack(id)),
    }
}

fn parse_bound(value: Option<&str>, default: i64) -> Result<i64, PluginError> {
    match value {
        Some(value) => value.parse::<i64>().map_err(|_| {
            PluginError::InvalidFields(format!("invalid balance bound: {:?}", value))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_exactly_one_transport() {
        let neither = PluginOpts {
            server: None,
            listener: None,
            prefix: "peer.a.".to_string(),
            info: serde_json::Value::Null,
            max_balance: None,
            min_balance: None,
            auth: AuthCheck::Token("secret".to_string()),
            store: None,
        };
        assert!(Plugin::new(neither).is_err());

        let both = PluginOpts {
            server: Some("btp+ws://u:t@localhost:1".to_string()),
            listener: Some(ListenerOpts::new(0)),
            ..PluginOpts::client("peer.a.", "btp+ws://u:t@localhost:1")
        };
        assert!(Plugin::new(both).is_err());
    }

    #[test]
    fn addresses_follow_the_transport_role() {
        let client = Plugin::new(PluginOpts::client(
            "peer.a.",
            "btp+ws://u:t@localhost:1",
        ))
        .unwrap();
        assert_eq!(client.account(), "peer.a.client");
        assert_eq!(client.peer_account(), "peer.a.server");

        let server = Plugin::new(PluginOpts::server(
            "peer.a.",
            ListenerOpts::new(0),
            "secret",
        ))
        .unwrap();
        assert_eq!(server.account(), "peer.a.server");
        assert_eq!(server.peer_account(), "peer.a.client");
    }

    #[test]
    fn rejects_malformed_balance_bounds() {
        let mut opts = PluginOpts::client("peer.a.", "btp+ws://u:t@localhost:1");
        opts.max_balance = Some("ten".to_string());
        assert!(Plugin::new(opts).is_err());
    }

    #[test]
    fn info_includes_the_prefix() {
        let mut opts = PluginOpts::client("peer.a.", "btp+ws://u:t@localhost:1");
        opts.info = serde_json::json!({ "currencyScale": 9 });
        let plugin = Plugin::new(opts).unwrap();
        let info = plugin.get_info();
        assert_eq!(info["prefix"], "peer.a.");
        assert_eq!(info["currencyScale"], 9);
        assert_eq!(info["account"], "peer.a.client");
    }
}
