//! In-process fake bus daemon
//!
//! A TCP server speaking the daemon wire framing, for integration
//! tests: records every frame clients send, answers the group-socket
//! handshake, and can push group packets to all connected clients.
//! Stopping it drops the listener and every connection, which is how
//! tests simulate a daemon crash.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use domus_knx::frame::{self, MSG_GROUP_PACKET, MSG_OPEN_GROUP_CON};
use domus_knx::Telegram;

/// A recorded inbound frame: message type and payload
pub type RecordedFrame = (u16, Vec<u8>);

pub struct FakeDaemon {
    local_addr: SocketAddr,
    received: Arc<Mutex<Vec<RecordedFrame>>>,
    outbound: broadcast::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl FakeDaemon {
    /// Start on an ephemeral port
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Start on a fixed port (0 = ephemeral); lets a test restart the
    /// daemon on the address a transport is already reconnecting to
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("fake daemon bind");
        let local_addr = listener.local_addr().expect("fake daemon addr");
        let received = Arc::new(Mutex::new(Vec::new()));
        // Large enough that flood tests cannot lag the client writers
        let (outbound, _) = broadcast::channel(2048);
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            received.clone(),
            outbound.clone(),
            cancel.clone(),
        ));

        Self {
            local_addr,
            received,
            outbound,
            cancel,
        }
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Transport URL for this daemon
    pub fn url(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    /// Push a telegram to every connected client as a group packet
    ///
    /// Clients parse the receive format, which prefixes the send-format
    /// APDU with the source individual address the daemon stamps.
    pub fn push_telegram(&self, telegram: &Telegram) {
        let mut packet = vec![0x11, 0x01];
        packet.extend_from_slice(&telegram.encode_group_packet());
        let message = frame::encode_frame(MSG_GROUP_PACKET, &packet);
        let _ = self.outbound.send(message);
    }

    /// Push raw bytes to every connected client, framing included
    pub fn push_raw(&self, message: Vec<u8>) {
        let _ = self.outbound.send(message);
    }

    /// Frames received from clients so far
    pub async fn received(&self) -> Vec<RecordedFrame> {
        self.received.lock().await.clone()
    }

    /// Group packets received from clients, parsed as telegrams
    pub async fn received_telegrams(&self) -> Vec<Telegram> {
        self.received
            .lock()
            .await
            .iter()
            .filter(|(msg_type, _)| *msg_type == MSG_GROUP_PACKET)
            .filter_map(|(_, payload)| {
                // Clients write the send format (no source address); the
                // receive-format parser needs the source prefix back
                let mut packet = vec![0x00, 0x00];
                packet.extend_from_slice(payload);
                Telegram::parse_group_packet(&packet).ok()
            })
            .collect()
    }

    /// Kill the daemon: listener and all connections drop
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    received: Arc<Mutex<Vec<RecordedFrame>>>,
    outbound: broadcast::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(_) => continue,
            },
        };
        tokio::spawn(serve_client(
            stream,
            received.clone(),
            outbound.subscribe(),
            cancel.clone(),
        ));
    }
}

async fn serve_client(
    stream: TcpStream,
    received: Arc<Mutex<Vec<RecordedFrame>>>,
    outbound: broadcast::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let (mut read_half, write_half) = stream.into_split();
    let (reply_tx, reply_rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(client_writer(write_half, outbound, reply_rx, cancel.clone()));

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = read_frame(&mut read_half) => read,
        };
        let Some((msg_type, payload)) = read else { return };
        // Handshake: the daemon confirms with the same type
        if msg_type == MSG_OPEN_GROUP_CON {
            let confirm = frame::encode_frame(MSG_OPEN_GROUP_CON, &[]);
            if reply_tx.send(confirm).await.is_err() {
                return;
            }
        }
        received.lock().await.push((msg_type, payload));
    }
}

async fn client_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: broadcast::Receiver<Vec<u8>>,
    mut reply_rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            pushed = outbound.recv() => match pushed {
                Ok(message) => message,
                Err(_) => return,
            },
            reply = reply_rx.recv() => match reply {
                Some(message) => message,
                None => return,
            },
        };
        if write_half.write_all(&message).await.is_err() {
            return;
        }
    }
}

async fn read_frame(stream: &mut tokio::net::tcp::OwnedReadHalf) -> Option<(u16, Vec<u8>)> {
    let mut size_buf = [0u8; 2];
    stream.read_exact(&mut size_buf).await.ok()?;
    let size = usize::from(u16::from_be_bytes(size_buf));

    let mut message = vec![0u8; 2 + size];
    message[..2].copy_from_slice(&size_buf);
    stream.read_exact(&mut message[2..]).await.ok()?;

    let (msg_type, payload) = frame::parse_frame(&message).ok()?;
    Some((msg_type, payload.to_vec()))
}
