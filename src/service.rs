use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, trace, warn};
use parking_lot::{Mutex, RwLock};
use rand::random;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tungstenite::Message;

use crate::errors::PluginError;
use crate::packet::{BtpError, BtpPacket, BtpResponse, ProtocolData, Serializable};

/// How long an outgoing request waits for the matching RESPONSE or ERROR.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
/// How long a server-accepted socket has to complete the auth handshake.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_millis(2000);

pub type WsError = tungstenite::Error;

/// How a socket slot came to be authenticated: sockets we dialed carry the
/// credentials we presented, accepted sockets carry the peer's username.
#[derive(Clone, Debug)]
pub enum Role {
    Client { username: String, token: String },
    Server { username: String },
}

impl Role {
    fn describe(&self) -> &'static str {
        match self {
            Role::Client { .. } => "client",
            Role::Server { .. } => "server",
        }
    }
}

/// Validator for credentials presented by inbound sockets.
#[derive(Clone)]
pub enum AuthCheck {
    /// Accept any username presenting this shared secret.
    Token(String),
    Custom(Arc<dyn Fn(&str, &str) -> bool + Send + Sync>),
}

impl AuthCheck {
    pub fn check(&self, username: &str, token: &str) -> bool {
        match self {
            AuthCheck::Token(secret) => secret == token,
            AuthCheck::Custom(check) => check(username, token),
        }
    }
}

/// A request frame (PREPARE, FULFILL, REJECT or MESSAGE) received on an
/// authenticated socket, tagged with the slot it arrived on so the response
/// goes back the same way.
#[derive(Debug)]
pub struct InboundRequest {
    pub slot: usize,
    pub packet: BtpPacket,
}

struct SocketSlot {
    sender: mpsc::UnboundedSender<Message>,
    role: Role,
    read_task: Option<JoinHandle<()>>,
    write_task: JoinHandle<()>,
}

type PendingSender = oneshot::Sender<Result<Vec<ProtocolData>, PluginError>>;

struct EngineInner {
    slots: RwLock<HashMap<usize, SocketSlot>>,
    // slot indices are never reused within an engine's lifetime
    next_slot: AtomicUsize,
    pending: Mutex<HashMap<u32, PendingSender>>,
    incoming_tx: mpsc::UnboundedSender<InboundRequest>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundRequest>>>,
    request_timeout: Duration,
}

/// The BTP RPC engine: a registry of authenticated socket slots, a
/// pending-request table correlating outgoing requests with their responses,
/// and a channel of inbound requests for the plugin core to drain.
///
/// Outgoing packets are broadcast to every slot; the first RESPONSE or ERROR
/// carrying the request id wins and later duplicates are discarded.
#[derive(Clone)]
pub struct RpcEngine {
    inner: Arc<EngineInner>,
}

impl RpcEngine {
    pub fn new(request_timeout: Duration) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        RpcEngine {
            inner: Arc::new(EngineInner {
                slots: RwLock::new(HashMap::new()),
                next_slot: AtomicUsize::new(0),
                pending: Mutex::new(HashMap::new()),
                incoming_tx,
                incoming_rx: Mutex::new(Some(incoming_rx)),
                request_timeout,
            }),
        }
    }

    /// The receiver of inbound requests. There is exactly one; the plugin
    /// core takes it when it starts dispatching.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<InboundRequest>> {
        self.inner.incoming_rx.lock().take()
    }

    pub fn num_connections(&self) -> usize {
        self.inner.slots.read().len()
    }

    /// Registers an authenticated socket and starts its read and write
    /// tasks. Returns the slot index.
    pub fn add_connection<S>(&self, role: Role, ws: S) -> usize
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Send
            + Unpin
            + 'static,
    {
        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (mut sink, mut stream) = ws.split();

        let write_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    debug!("websocket send on slot {} failed: {}", slot, err);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        debug!("added {} connection in slot {}", role.describe(), slot);
        self.inner.slots.write().insert(
            slot,
            SocketSlot {
                sender: tx,
                role,
                read_task: None,
                write_task,
            },
        );

        let engine = self.inner.clone();
        let read_task = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(message) => {
                        if message.is_binary() {
                            if !dispatch(&engine, slot, &message.into_data()) {
                                break;
                            }
                        } else if message.is_close() {
                            debug!("slot {} received close frame", slot);
                            break;
                        }
                        // pings and pongs are answered by the transport
                    }
                    Err(err) => {
                        warn!("websocket error on slot {}: {}", slot, err);
                        break;
                    }
                }
            }
            let remaining = {
                let mut slots = engine.slots.write();
                slots.remove(&slot);
                slots.len()
            };
            debug!("slot {} closed ({} connections still open)", slot, remaining);
        });

        if let Some(entry) = self.inner.slots.write().get_mut(&slot) {
            entry.read_task = Some(read_task);
        }
        slot
    }

    /// Issues an outgoing request: picks a fresh random request id, registers
    /// it in the pending table, broadcasts the frame to every slot and waits
    /// for exactly one of RESPONSE, ERROR or timeout.
    pub async fn request<F>(&self, build: F) -> Result<Vec<ProtocolData>, PluginError>
    where
        F: FnOnce(u32) -> BtpPacket,
    {
        let senders: Vec<mpsc::UnboundedSender<Message>> = self
            .inner
            .slots
            .read()
            .values()
            .map(|slot| slot.sender.clone())
            .collect();
        if senders.is_empty() {
            return Err(PluginError::Unreachable("no open connections".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut pending = self.inner.pending.lock();
            let mut id = random::<u32>();
            while pending.contains_key(&id) {
                id = random::<u32>();
            }
            pending.insert(id, tx);
            id
        };

        let message = Message::Binary(build(request_id).to_bytes());
        trace!(
            "sending request {} to {} connection(s)",
            request_id,
            senders.len()
        );
        for sender in &senders {
            // a closed slot is cleaned up by its own read task
            let _ = sender.send(message.clone());
        }

        match timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PluginError::Unreachable("connection closed".to_string())),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(PluginError::Unreachable(format!(
                    "request {} timed out",
                    request_id
                )))
            }
        }
    }

    /// Sends the reply for an inbound request back on the slot it arrived on.
    /// Failures become typed ERROR frames carrying the mapped code.
    pub fn respond(
        &self,
        slot: usize,
        request_id: u32,
        result: Result<Vec<ProtocolData>, &PluginError>,
    ) {
        let packet = match result {
            Ok(protocol_data) => BtpPacket::Response(BtpResponse {
                request_id,
                protocol_data,
            }),
            Err(err) => error_packet(request_id, err),
        };
        let sender = self
            .inner
            .slots
            .read()
            .get(&slot)
            .map(|slot| slot.sender.clone());
        match sender {
            Some(sender) => {
                if sender.send(Message::Binary(packet.to_bytes())).is_err() {
                    warn!("slot {} went away before request {} could be answered", slot, request_id);
                }
            }
            None => warn!(
                "slot {} went away before request {} could be answered",
                slot, request_id
            ),
        }
    }

    /// Closes every socket and fails all in-flight requests with a uniform
    /// connection-closed error.
    pub fn close(&self) {
        let slots: Vec<SocketSlot> = {
            let mut slots = self.inner.slots.write();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            if let Some(read_task) = &slot.read_task {
                read_task.abort();
            }
            slot.write_task.abort();
        }
        let pending: Vec<PendingSender> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().map(|(_, sender)| sender).collect()
        };
        for sender in pending {
            let _ = sender.send(Err(PluginError::Unreachable(
                "connection closed".to_string(),
            )));
        }
        debug!("closed {} connection(s)", slots.len());
    }
}

/// Routes one decoded frame. RESPONSE and ERROR resolve the pending table;
/// request frames go to the plugin core. Returns `false` when the socket
/// must be closed (malformed traffic on an authenticated connection).
fn dispatch(engine: &Arc<EngineInner>, slot: usize, data: &[u8]) -> bool {
    match BtpPacket::from_bytes(data) {
        Ok(BtpPacket::Response(response)) => {
            resolve(engine, response.request_id, Ok(response.protocol_data));
            true
        }
        Ok(BtpPacket::Error(error)) => {
            trace!(
                "got error response {} {} for request {}",
                error.code,
                error.name,
                error.request_id
            );
            let request_id = error.request_id;
            resolve(
                engine,
                request_id,
                Err(PluginError::Remote {
                    code: error.code,
                    name: error.name,
                    data: error.data,
                }),
            );
            true
        }
        Ok(packet) => {
            if engine
                .incoming_tx
                .send(InboundRequest { slot, packet })
                .is_err()
            {
                warn!("dropping inbound request on slot {}: dispatcher is gone", slot);
            }
            true
        }
        Err(err) => {
            error!("malformed BTP packet on slot {}: {}", slot, err);
            false
        }
    }
}

fn resolve(
    engine: &EngineInner,
    request_id: u32,
    result: Result<Vec<ProtocolData>, PluginError>,
) {
    let sender = engine.pending.lock().remove(&request_id);
    match sender {
        Some(sender) => {
            // the requester may have timed out in the meantime
            let _ = sender.send(result);
        }
        None => warn!(
            "discarding response for unknown or already-resolved request {}",
            request_id
        ),
    }
}

/// Builds the ERROR frame for a failed handler invocation.
pub(crate) fn error_packet(request_id: u32, error: &PluginError) -> BtpPacket {
    BtpPacket::Error(BtpError {
        request_id,
        code: error.code().as_str().to_string(),
        name: error.name().to_string(),
        triggered_at: Utc::now(),
        data: error.frame_data(),
        protocol_data: Vec::new(),
    })
}
