//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::{Admission, ConnectionError, ConnectionId, Rejection, UpgradeRequest};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// The only path that may be upgraded. Anything else gets a 404.
    pub path: String,
    /// Upper bound on the HTTP upgrade exchange.
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            path: "/realtime".to_string(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Listens for incoming realtime connections.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: Arc<TransportConfig>,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str, config: TransportConfig) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(ConnectionError::Accept)?;
        tracing::info!(addr, path = %config.path, "realtime transport listening");
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for the next TCP connection.
    ///
    /// Returns as soon as the socket is accepted; the upgrade happens in
    /// [`PendingConnection::upgrade`], normally on the connection's own
    /// task, so one slow client never stalls the accept loop.
    pub async fn accept(&self) -> Result<PendingConnection, ConnectionError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(ConnectionError::Accept)?;
        tracing::trace!(%peer, "accepted tcp connection");
        Ok(PendingConnection {
            stream,
            peer,
            config: Arc::clone(&self.config),
        })
    }
}

/// An accepted socket that hasn't been upgraded yet.
pub struct PendingConnection {
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<TransportConfig>,
}

impl PendingConnection {
    /// Remote address of the socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Performs the WebSocket upgrade, consulting `gate` before accepting.
    ///
    /// # Errors
    /// - [`ConnectionError::Rejected`]: wrong path or the gate said no;
    ///   the client received that HTTP status.
    /// - [`ConnectionError::UpgradeFailed`]: malformed request, I/O
    ///   failure, or the handshake overran its timeout.
    pub async fn upgrade<A: Admission>(
        self,
        gate: &A,
    ) -> Result<(WebSocketConnection, A::Identity), ConnectionError> {
        let Self {
            stream,
            peer,
            config,
        } = self;

        // The handshake callback is synchronous and consumed by the
        // handshake future, so the verdict travels back over a oneshot.
        let (verdict_tx, mut verdict_rx) = oneshot::channel::<Result<A::Identity, Rejection>>();
        let path = config.path.clone();

        let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() != path {
                let rejection = Rejection::not_found();
                let reply = error_response(&rejection);
                let _ = verdict_tx.send(Err(rejection));
                return Err(reply);
            }

            let credential = extract_credential(req);
            let user_agent = req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok());
            let request = UpgradeRequest {
                path: req.uri().path(),
                credential: credential.as_deref(),
                peer,
                user_agent,
            };

            match gate.admit(&request) {
                Ok(identity) => {
                    let _ = verdict_tx.send(Ok(identity));
                    Ok(response)
                }
                Err(rejection) => {
                    let reply = error_response(&rejection);
                    let _ = verdict_tx.send(Err(rejection));
                    Err(reply)
                }
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async(stream, callback);
        let ws = match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Err(_) => {
                return Err(ConnectionError::UpgradeFailed(
                    "handshake timed out".into(),
                ));
            }
            Ok(Err(e)) => {
                return Err(match verdict_rx.try_recv() {
                    Ok(Err(rejection)) => {
                        tracing::debug!(%peer, status = rejection.status, reason = %rejection.reason, "upgrade rejected");
                        ConnectionError::Rejected {
                            status: rejection.status,
                            reason: rejection.reason,
                        }
                    }
                    _ => ConnectionError::UpgradeFailed(e.to_string()),
                });
            }
            Ok(Ok(ws)) => ws,
        };

        let identity = match verdict_rx.try_recv() {
            Ok(Ok(identity)) => identity,
            _ => {
                return Err(ConnectionError::UpgradeFailed(
                    "upgrade completed without an admission verdict".into(),
                ));
            }
        };

        let id = ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, %peer, "upgraded realtime connection");

        Ok((WebSocketConnection { id, peer, ws }, identity))
    }
}

/// Pulls the client credential out of an upgrade request.
///
/// `Authorization: Bearer <token>` wins; otherwise the `token` query
/// parameter is used (browsers can't set headers on `new WebSocket()`).
pub fn extract_credential(req: &Request) -> Option<String> {
    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
            .filter(|t| !t.is_empty())
    })
}

fn error_response(rejection: &Rejection) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(rejection.reason.clone()));
    *response.status_mut() =
        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::FORBIDDEN);
    response
}

/// An upgraded, admitted WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    peer: SocketAddr,
    ws: WsStream,
}

impl WebSocketConnection {
    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Splits the connection so reading and writing can run on separate
    /// tasks without contending on a lock.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let (sink, stream) = self.ws.split();
        (
            FrameReader {
                id: self.id,
                stream,
            },
            FrameWriter { id: self.id, sink },
        )
    }
}

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Control ping (tungstenite answers it automatically).
    Ping,
    /// Control pong, usually the answer to our heartbeat.
    Pong,
}

/// Read half of a [`WebSocketConnection`].
pub struct FrameReader {
    id: ConnectionId,
    stream: SplitStream<WsStream>,
}

impl FrameReader {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Receives the next frame.
    ///
    /// Returns `Ok(None)` when the client closed the connection cleanly.
    pub async fn next_frame(&mut self) -> Result<Option<Inbound>, ConnectionError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Inbound::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Inbound::Binary(data.to_vec())));
                }
                Some(Ok(Message::Ping(_))) => return Ok(Some(Inbound::Ping)),
                Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Pong)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(e)) => return Err(ConnectionError::Receive(e.to_string())),
            }
        }
    }
}

/// Write half of a [`WebSocketConnection`].
pub struct FrameWriter {
    id: ConnectionId,
    sink: SplitSink<WsStream, Message>,
}

impl FrameWriter {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Sends one text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(send_error)
    }

    /// Sends a heartbeat ping control frame.
    pub async fn send_ping(&mut self) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(send_error)
    }

    /// Sends a close frame with the given code and reason, then closes
    /// the sink.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), ConnectionError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(send_error)?;
        self.sink.close().await.map_err(send_error)
    }
}

fn send_error(e: WsError) -> ConnectionError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Closed,
        other => ConnectionError::Send(other.to_string()),
    }
}
