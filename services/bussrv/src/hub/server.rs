//! Websocket listener and per-connection pumps
//!
//! Plain TCP listener upgraded per connection by tokio-tungstenite. The
//! connect ticket rides in the URL query string and is redeemed during
//! the handshake callback; a bad ticket never reaches the websocket
//! layer. Each connection runs a write pump (queue → socket, plus
//! protocol pings) and a read pump (socket → protocol handler) that
//! deregisters the session exactly once on the way out.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::{ErrorExt, Result};
use crate::hub::protocol::{channels, ClientMessage, ServerMessage};
use crate::hub::sessions::Hub;
use crate::hub::ticket::TicketValidator;

/// Running hub listener
pub struct HubServer {
    local_addr: SocketAddr,
}

impl HubServer {
    /// Bind the listener and start accepting clients
    pub async fn start(
        config: HubConfig,
        hub: Arc<Hub>,
        validator: Arc<dyn TicketValidator>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .io_error(&format!("binding hub listener on {}", config.bind))?;
        let local_addr = listener
            .local_addr()
            .io_error("reading hub listener address")?;
        info!("Hub listening on ws://{}", local_addr);

        tokio::spawn(accept_loop(listener, config, hub, validator, cancel));

        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: HubConfig,
    hub: Arc<Hub>,
    validator: Arc<dyn TicketValidator>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Hub accept failed: {}", e);
                    continue;
                },
            },
        };

        debug!("Hub connection from {}", peer);
        let config = config.clone();
        let hub = hub.clone();
        let validator = validator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, config, hub, validator, cancel).await {
                debug!("Hub connection from {} ended: {}", peer, e);
            }
        });
    }
    debug!("Hub accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    config: HubConfig,
    hub: Arc<Hub>,
    validator: Arc<dyn TicketValidator>,
    cancel: CancellationToken,
) -> Result<()> {
    // Redeem the ticket inside the handshake so rejects stay plain HTTP
    let callback = |request: &Request, response: Response| {
        let ticket = request.uri().query().and_then(query_ticket);
        match ticket {
            Some(ticket) if validator.redeem(&ticket) => Ok(response),
            _ => {
                let mut reject = ErrorResponse::new(Some("invalid ticket".to_string()));
                *reject.status_mut() = StatusCode::UNAUTHORIZED;
                Err(reject)
            },
        }
    };
    let websocket = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .connection_error("hub websocket handshake")?;

    let session_id = Uuid::new_v4().to_string();
    let (queue_tx, queue_rx) = mpsc::channel::<ServerMessage>(config.client_queue);
    hub.register(&session_id, queue_tx.clone());

    let _ = queue_tx
        .send(ServerMessage::Connected {
            session_id: session_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .await;

    let (ws_writer, ws_reader) = websocket.split();
    let write_task = tokio::spawn(write_pump(
        ws_writer,
        queue_rx,
        config.clone(),
        cancel.clone(),
    ));

    read_pump(ws_reader, &session_id, &config, &hub, &queue_tx).await;

    // Deregister before dropping the queue so broadcast stops seeing
    // this session first
    hub.unregister(&session_id);
    drop(queue_tx);
    let _ = write_task.await;
    Ok(())
}

/// Queue → socket, plus protocol pings on an interval
async fn write_pump(
    mut writer: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        Message,
    >,
    mut queue_rx: mpsc::Receiver<ServerMessage>,
    config: HubConfig,
    cancel: CancellationToken,
) {
    let mut ping_tick = tokio::time::interval(config.ping_interval());
    ping_tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = writer.send(Message::Close(None)).await;
                break;
            },
            _ = ping_tick.tick() => {
                if writer.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            },
            maybe = queue_rx.recv() => {
                let Some(message) = maybe else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode hub message: {}", e);
                        continue;
                    },
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            },
        }
    }
}

/// Socket → protocol handler
///
/// The server pings on `ping_interval`, so a live client produces at
/// least pong traffic; total inbound silence for `pong_timeout` means
/// the client is gone.
async fn read_pump(
    mut reader: futures::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>,
    session_id: &str,
    config: &HubConfig,
    hub: &Hub,
    queue_tx: &mpsc::Sender<ServerMessage>,
) {
    loop {
        let frame = match tokio::time::timeout(config.pong_timeout(), reader.next()).await {
            Err(_) => {
                warn!("Session {} silent past pong timeout, closing", session_id);
                return;
            },
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!("Session {} read error: {}", session_id, e);
                return;
            },
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let reply = handle_client_message(session_id, hub, &text);
                if queue_tx.send(reply).await.is_err() {
                    return;
                }
            },
            Message::Close(_) => return,
            // Pongs and client pings are liveness traffic, nothing more
            Message::Ping(_) | Message::Pong(_) => {},
            Message::Binary(_) => {
                let reply =
                    ServerMessage::error("UNSUPPORTED", "binary frames are not supported");
                if queue_tx.send(reply).await.is_err() {
                    return;
                }
            },
            Message::Frame(_) => {},
        }
    }
}

fn handle_client_message(session_id: &str, hub: &Hub, text: &str) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return ServerMessage::error("BAD_MESSAGE", e.to_string()),
    };

    match message {
        ClientMessage::Subscribe { channels: requested } => {
            if let Some(unknown) = requested.iter().find(|c| !channels::is_known(c)) {
                return ServerMessage::error(
                    "UNKNOWN_CHANNEL",
                    format!("unknown channel '{}'", unknown),
                );
            }
            ServerMessage::Response {
                channels: hub.subscribe(session_id, &requested),
            }
        },
        ClientMessage::Unsubscribe { channels: requested } => ServerMessage::Response {
            channels: hub.unsubscribe(session_id, &requested),
        },
        ClientMessage::Ping { timestamp } => ServerMessage::Pong {
            timestamp: timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
        },
    }
}

fn query_ticket(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        pair.strip_prefix("ticket=")
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_ticket_extraction() {
        assert_eq!(query_ticket("ticket=abc"), Some("abc".to_string()));
        assert_eq!(
            query_ticket("session=1&ticket=abc&x=y"),
            Some("abc".to_string())
        );
        assert_eq!(query_ticket("ticket="), None);
        assert_eq!(query_ticket("token=abc"), None);
    }

    #[test]
    fn test_subscribe_to_unknown_channel_rejected() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(8);
        hub.register("s", tx);

        let reply = handle_client_message(
            "s",
            &hub,
            r#"{"type":"subscribe","channels":["device.deleted"]}"#,
        );
        assert!(matches!(reply, ServerMessage::Error { code, .. } if code == "UNKNOWN_CHANNEL"));
    }

    #[test]
    fn test_ping_gets_pong_with_echoed_timestamp() {
        let hub = Hub::new();
        let reply = handle_client_message("s", &hub, r#"{"type":"ping","timestamp":42}"#);
        assert!(matches!(reply, ServerMessage::Pong { timestamp: 42 }));
    }
}
