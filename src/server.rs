use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tungstenite::Message;

use crate::errors::PluginError;
use crate::packet::{BtpPacket, BtpResponse, Serializable};
use crate::service::{error_packet, AuthCheck, Role, RpcEngine, WsError, DEFAULT_AUTH_TIMEOUT};

/// Where the listener binds. TLS termination is left to fronting
/// infrastructure; the listener itself speaks plain WebSocket.
#[derive(Clone, Copy, Debug)]
pub struct ListenerOpts {
    pub bind: IpAddr,
    pub port: u16,
}

impl ListenerOpts {
    pub fn new(port: u16) -> Self {
        ListenerOpts {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        }
    }
}

/// A running accept loop. Dropping the handle does not stop it; `shutdown`
/// does.
pub struct Listener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn shutdown(&self) {
        self.accept_task.abort();
    }
}

/// Binds the listener and starts accepting sockets. Each accepted socket
/// must complete the auth handshake within `DEFAULT_AUTH_TIMEOUT` before it
/// is handed to the engine.
pub async fn start_listener(
    opts: &ListenerOpts,
    engine: RpcEngine,
    auth: AuthCheck,
) -> Result<Listener, PluginError> {
    let listener = TcpListener::bind((opts.bind, opts.port))
        .await
        .map_err(|err| {
            PluginError::Unreachable(format!(
                "cannot bind listener on {}:{}: {}",
                opts.bind, opts.port, err
            ))
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| PluginError::Unreachable(format!("cannot read local address: {}", err)))?;
    debug!("listening for BTP connections on {}", local_addr);

    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let engine = engine.clone();
                    let auth = auth.clone();
                    tokio::spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws) => handle_socket(engine, auth, ws, addr).await,
                            Err(err) => {
                                warn!("websocket handshake with {} failed: {}", addr, err)
                            }
                        }
                    });
                }
                Err(err) => warn!("accept failed: {}", err),
            }
        }
    });

    Ok(Listener {
        local_addr,
        accept_task,
    })
}

async fn handle_socket<S>(engine: RpcEngine, auth: AuthCheck, mut ws: S, addr: SocketAddr)
where
    S: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Send
        + Unpin
        + 'static,
{
    match timeout(DEFAULT_AUTH_TIMEOUT, authenticate(&mut ws, &auth)).await {
        Ok(Ok(username)) => {
            debug!("authenticated connection from {} as {:?}", addr, username);
            engine.add_connection(Role::Server { username }, ws);
        }
        Ok(Err(refusal)) => {
            warn!("closing connection from {}: {}", addr, refusal.error);
            refuse(&mut ws, refusal).await;
        }
        Err(_) => {
            warn!(
                "closing connection from {}: no auth within {:?}",
                addr, DEFAULT_AUTH_TIMEOUT
            );
            refuse(
                &mut ws,
                Refusal {
                    request_id: 0,
                    error: PluginError::NotAccepted("authentication timed out".to_string()),
                },
            )
            .await;
        }
    }
}

struct Refusal {
    request_id: u32,
    error: PluginError,
}

/// Waits for the first binary frame and validates it as the auth MESSAGE.
/// Non-binary frames (pings from eager peers) are skipped. On success the
/// empty RESPONSE completing the handshake has already been sent.
async fn authenticate<S>(ws: &mut S, auth: &AuthCheck) -> Result<String, Refusal>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let message = match ws.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                return Err(Refusal {
                    request_id: 0,
                    error: PluginError::Unreachable(format!("websocket error during auth: {}", err)),
                });
            }
            None => {
                return Err(Refusal {
                    request_id: 0,
                    error: PluginError::Unreachable("connection closed during auth".to_string()),
                });
            }
        };
        if !message.is_binary() {
            continue;
        }

        let auth_message = match parse_auth(&message.into_data()) {
            Ok(auth_message) => auth_message,
            Err((request_id, error)) => return Err(Refusal { request_id, error }),
        };
        if !auth.check(&auth_message.username, &auth_message.token) {
            return Err(Refusal {
                request_id: auth_message.request_id,
                error: PluginError::NotAccepted("invalid auth credentials".to_string()),
            });
        }

        let response = Message::Binary(
            BtpPacket::Response(BtpResponse {
                request_id: auth_message.request_id,
                protocol_data: Vec::new(),
            })
            .to_bytes(),
        );
        return match ws.send(response).await {
            Ok(()) => Ok(auth_message.username),
            Err(err) => Err(Refusal {
                request_id: auth_message.request_id,
                error: PluginError::Unreachable(format!("cannot send auth response: {}", err)),
            }),
        };
    }
}

#[derive(Debug)]
struct AuthMessage {
    request_id: u32,
    username: String,
    token: String,
}

/// The first frame must be a MESSAGE whose first sub-protocol is `auth`,
/// with `auth_username` and `auth_token` parts alongside it.
fn parse_auth(data: &[u8]) -> Result<AuthMessage, (u32, PluginError)> {
    let message = match BtpPacket::from_bytes(data) {
        Ok(BtpPacket::Message(message)) => message,
        Ok(other) => {
            return Err((
                other.request_id(),
                PluginError::InvalidFields("expected an auth message".to_string()),
            ));
        }
        Err(err) => {
            return Err((
                0,
                PluginError::InvalidFields(format!("malformed auth packet: {}", err)),
            ));
        }
    };
    let request_id = message.request_id;

    match message.protocol_data.first() {
        Some(first) if first.protocol_name == "auth" => {}
        _ => {
            return Err((
                request_id,
                PluginError::InvalidFields(
                    "first sub-protocol of the auth message must be auth".to_string(),
                ),
            ));
        }
    }

    let mut username = None;
    let mut token = None;
    for part in &message.protocol_data {
        match part.protocol_name.as_ref() {
            "auth_username" => username = String::from_utf8(part.data.clone()).ok(),
            "auth_token" => token = String::from_utf8(part.data.clone()).ok(),
            _ => {}
        }
    }
    match (username, token) {
        (Some(username), Some(token)) => Ok(AuthMessage {
            request_id,
            username,
            token,
        }),
        _ => Err((
            request_id,
            PluginError::InvalidFields(
                "auth message is missing auth_username or auth_token".to_string(),
            ),
        )),
    }
}

async fn refuse<S>(ws: &mut S, refusal: Refusal)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let error = error_packet(refusal.request_id, &refusal.error);
    let _ = ws.send(Message::Binary(error.to_bytes())).await;
    let _ = ws.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{BtpMessage, ProtocolData};

    fn auth_bytes(parts: Vec<ProtocolData>) -> Vec<u8> {
        BtpPacket::Message(BtpMessage {
            request_id: 77,
            protocol_data: parts,
        })
        .to_bytes()
    }

    #[test]
    fn accepts_a_well_formed_auth_message() {
        let bytes = auth_bytes(vec![
            ProtocolData::octet_stream("auth", Vec::new()),
            ProtocolData::text("auth_username", "alice".to_string()),
            ProtocolData::text("auth_token", "hunter2".to_string()),
        ]);
        let auth = parse_auth(&bytes).unwrap();
        assert_eq!(auth.request_id, 77);
        assert_eq!(auth.username, "alice");
        assert_eq!(auth.token, "hunter2");
    }

    #[test]
    fn refuses_when_auth_is_not_the_primary_protocol() {
        let bytes = auth_bytes(vec![
            ProtocolData::text("auth_username", "alice".to_string()),
            ProtocolData::octet_stream("auth", Vec::new()),
            ProtocolData::text("auth_token", "hunter2".to_string()),
        ]);
        let (request_id, error) = parse_auth(&bytes).unwrap_err();
        assert_eq!(request_id, 77);
        assert!(matches!(error, PluginError::InvalidFields(_)));
    }

    #[test]
    fn refuses_missing_credentials() {
        let bytes = auth_bytes(vec![ProtocolData::octet_stream("auth", Vec::new())]);
        let (_, error) = parse_auth(&bytes).unwrap_err();
        assert!(matches!(error, PluginError::InvalidFields(_)));
    }

    #[test]
    fn refuses_non_message_frames() {
        let bytes = BtpPacket::Response(BtpResponse {
            request_id: 9,
            protocol_data: Vec::new(),
        })
        .to_bytes();
        let (request_id, error) = parse_auth(&bytes).unwrap_err();
        assert_eq!(request_id, 9);
        assert!(matches!(error, PluginError::InvalidFields(_)));
    }

    #[test]
    fn refuses_garbage() {
        let (request_id, error) = parse_auth(&[0xde, 0xad]).unwrap_err();
        assert_eq!(request_id, 0);
        assert!(matches!(error, PluginError::InvalidFields(_)));
    }
}
