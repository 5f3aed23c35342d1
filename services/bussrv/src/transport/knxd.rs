//! Daemon transport client
//!
//! Framed client for the bus daemon's group socket (TCP or unix,
//! selected by URL scheme). A manager task owns the connection: it
//! opens the group socket, runs the framed read loop, and drives
//! reconnection through the shared backoff state machine when the
//! connection drops. Malformed frames are counted and skipped; they
//! never terminate the read loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use domus_knx::frame::{self, MSG_CLOSE, MSG_GROUP_PACKET};
use domus_knx::Telegram;

use crate::config::TransportConfig;
use crate::error::{BusSrvError, Result};
use crate::transport::reconnect::{ReconnectError, ReconnectHelper, ReconnectPolicy};
use crate::transport::{BusTransport, TransportCounters, TransportStats};

type DaemonReader = Box<dyn AsyncRead + Send + Unpin>;
type DaemonWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared connection state between the handle and the manager task
struct Shared {
    connected: AtomicBool,
    counters: TransportCounters,
    writer: Mutex<Option<DaemonWriter>>,
}

/// Transport implementation for a knxd-style bus daemon
pub struct KnxdTransport {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl KnxdTransport {
    /// Start the transport
    ///
    /// Returns the handle and the bounded inbound telegram channel. The
    /// manager task keeps the connection alive until `cancel` fires or
    /// the reconnect policy gives up.
    pub fn start(
        config: TransportConfig,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Telegram>) {
        let (tx, rx) = mpsc::channel(config.telegram_queue);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            counters: TransportCounters::default(),
            writer: Mutex::new(None),
        });

        let transport = Arc::new(Self {
            shared: shared.clone(),
            cancel: cancel.clone(),
        });

        tokio::spawn(manager_loop(config, shared, tx, cancel));

        (transport, rx)
    }
}

#[async_trait]
impl BusTransport for KnxdTransport {
    async fn send(&self, telegram: &Telegram) -> Result<()> {
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(BusSrvError::not_connected)?;

        let message = frame::encode_frame(MSG_GROUP_PACKET, &telegram.encode_group_packet());
        if let Err(e) = write_all_flush(writer, &message).await {
            // Writer is broken; the read loop will notice and reconnect
            guard.take();
            self.shared.connected.store(false, Ordering::SeqCst);
            return Err(BusSrvError::connection(format!("send failed: {}", e)));
        }

        self.shared.counters.record_sent();
        debug!("Sent {}", telegram);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let mut guard = self.shared.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            // Best effort: tell the daemon we are leaving
            let _ = write_all_flush(&mut writer, &frame::encode_frame(MSG_CLOSE, &[])).await;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn write_all_flush(writer: &mut DaemonWriter, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

// ============================================================================
// Manager task
// ============================================================================

async fn manager_loop(
    config: TransportConfig,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Telegram>,
    cancel: CancellationToken,
) {
    let policy = ReconnectPolicy::from_config(
        config.reconnect_max_attempts,
        config.reconnect_initial_delay_ms,
        config.reconnect_max_delay_ms,
        config.reconnect_backoff_multiplier,
    );
    let mut helper = ReconnectHelper::new(policy);
    let mut first_connect = true;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // The connect closure hands the read half out through a slot;
        // execute_reconnect only sees success or failure.
        let reader_slot: Arc<Mutex<Option<DaemonReader>>> = Arc::new(Mutex::new(None));
        let connect_result = {
            let config = config.clone();
            let shared = shared.clone();
            let slot = reader_slot.clone();
            helper
                .execute_reconnect(move || {
                    let config = config.clone();
                    let shared = shared.clone();
                    let slot = slot.clone();
                    async move {
                        let (reader, writer) = dial(&config).await?;
                        *shared.writer.lock().await = Some(writer);
                        *slot.lock().await = Some(reader);
                        Ok::<(), BusSrvError>(())
                    }
                })
                .await
        };

        match connect_result {
            Ok(()) => {
                if !first_connect {
                    shared.counters.record_reconnect();
                }
                first_connect = false;
                shared.connected.store(true, Ordering::SeqCst);
                info!("Connected to bus daemon at {}", config.url);
            },
            Err(ReconnectError::MaxAttemptsExceeded) => {
                error!("Bus daemon unreachable, transport giving up");
                break;
            },
            Err(_) => continue,
        }

        let reader = match reader_slot.lock().await.take() {
            Some(reader) => reader,
            None => continue,
        };

        let exit = read_loop(reader, &shared, &tx, &cancel).await;

        shared.connected.store(false, Ordering::SeqCst);
        shared.writer.lock().await.take();

        match exit {
            ReadExit::Shutdown => break,
            ReadExit::ConnectionLost => {
                warn!("Bus daemon connection lost, reconnecting");
            },
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    debug!("Transport manager stopped");
}

enum ReadExit {
    Shutdown,
    ConnectionLost,
}

/// Framed read loop
///
/// One iteration reads exactly one daemon message: the two-byte size
/// field, then the remainder. Parse failures of the inner group packet
/// are recoverable; socket errors are not.
async fn read_loop(
    mut reader: DaemonReader,
    shared: &Shared,
    tx: &mpsc::Sender<Telegram>,
    cancel: &CancellationToken,
) -> ReadExit {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return ReadExit::Shutdown,
            result = read_message(&mut reader) => match result {
                Ok(message) => message,
                Err(e) => {
                    debug!("Daemon read error: {}", e);
                    return ReadExit::ConnectionLost;
                },
            },
        };

        let (msg_type, payload) = match frame::parse_frame(&message) {
            Ok(parsed) => parsed,
            Err(e) => {
                shared.counters.record_frame_error();
                warn!("Dropping malformed daemon frame: {}", e);
                continue;
            },
        };

        if msg_type != MSG_GROUP_PACKET {
            debug!("Ignoring daemon message type 0x{:04X}", msg_type);
            continue;
        }

        match Telegram::parse_group_packet(payload) {
            Ok(telegram) => {
                shared.counters.record_received();
                // Bounded handoff: a flooded pipeline slows this reader
                // down instead of growing memory
                if tx.send(telegram).await.is_err() {
                    return ReadExit::Shutdown;
                }
            },
            Err(e) => {
                shared.counters.record_frame_error();
                warn!("Dropping unparseable group packet: {}", e);
            },
        }
    }
}

/// Read one size-prefixed daemon message, returning the complete frame
/// (size field included) for [`frame::parse_frame`]
async fn read_message(reader: &mut DaemonReader) -> std::io::Result<Vec<u8>> {
    let mut size_buf = [0u8; 2];
    reader.read_exact(&mut size_buf).await?;
    let size = usize::from(u16::from(size_buf[0]) << 8 | u16::from(size_buf[1]));

    let mut message = vec![0u8; 2 + size];
    message[0] = size_buf[0];
    message[1] = size_buf[1];
    reader.read_exact(&mut message[2..]).await?;
    Ok(message)
}

/// Dial the daemon endpoint and perform the group-socket handshake
async fn dial(config: &TransportConfig) -> Result<(DaemonReader, DaemonWriter)> {
    let (reader, mut writer): (DaemonReader, DaemonWriter) =
        if let Some(addr) = config.url.strip_prefix("tcp://") {
            let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    BusSrvError::timeout(format!("connecting to daemon at {}", addr))
                })??;
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            (Box::new(r), Box::new(w))
        } else if let Some(path) = config.url.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                let stream =
                    tokio::time::timeout(config.connect_timeout(), UnixStream::connect(path))
                        .await
                        .map_err(|_| {
                            BusSrvError::timeout(format!("connecting to daemon at {}", path))
                        })??;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(not(unix))]
            {
                return Err(BusSrvError::config(
                    "unix:// transport URLs require a unix platform",
                ));
            }
        } else {
            return Err(BusSrvError::config(format!(
                "transport URL '{}' must start with tcp:// or unix://",
                config.url
            )));
        };

    // Open the group socket; the daemon answers with the same type
    write_all_flush(&mut writer, &frame::open_group_con())
        .await
        .map_err(|e| BusSrvError::connection(format!("group socket handshake: {}", e)))?;

    Ok((reader, writer))
}
