//! TCP transport.
//!
//! Frames are a `u32` big-endian length followed by one JSON [`Message`].
//! Each connection gets a reader loop feeding [`ChainSync`] and a writer
//! task draining a per-peer queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use lumen_core::{now_ms, BusMessage};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::error::P2pError;
use crate::message::Message;
use crate::peers::PeerId;
use crate::sync::{ChainSync, Outbound};

/// Default frame size cap (2 MiB).
pub const DEFAULT_MAX_INPUT_SIZE: usize = 2 * 1024 * 1024;

/// Outbound connection attempts give up after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Encode `msg` as one length-prefixed frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, P2pError> {
    let body = serde_json::to_vec(msg).map_err(|e| P2pError::Codec(e.to_string()))?;
    let len = u32::try_from(body.len()).map_err(|_| P2pError::Oversized {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), P2pError> {
    let frame = encode_frame(msg)?;
    w.write_all(&frame).await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream.
///
/// A frame above `max_input_size` is an error and leaves the stream
/// unusable. A frame that is not a known message is consumed and reported
/// as [`P2pError::Codec`], so the caller may keep reading.
pub async fn read_message<R: AsyncRead + Unpin>(
    r: &mut R,
    max_input_size: usize,
) -> Result<Option<Message>, P2pError> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = r.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_input_size {
        return Err(P2pError::Oversized {
            len,
            max: max_input_size,
        });
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| P2pError::Codec(e.to_string()))
}

struct PeerHandle {
    tx: mpsc::UnboundedSender<Message>,
    close: Arc<Notify>,
}

/// Connections, framing and outbound dispatch around a shared [`ChainSync`].
pub struct Network {
    sync: Arc<Mutex<ChainSync>>,
    handles: Mutex<HashMap<PeerId, PeerHandle>>,
    max_input_size: usize,
    deliver: mpsc::UnboundedSender<BusMessage>,
    dial_tx: mpsc::UnboundedSender<String>,
    dial_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Network {
    /// Transport for `sync`; bus envelopes for this node go to `deliver`.
    pub fn new(
        sync: Arc<Mutex<ChainSync>>,
        max_input_size: usize,
        deliver: mpsc::UnboundedSender<BusMessage>,
    ) -> Arc<Self> {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sync,
            handles: Mutex::new(HashMap::new()),
            max_input_size,
            deliver,
            dial_tx,
            dial_rx: Mutex::new(Some(dial_rx)),
        })
    }

    /// The shared engine.
    pub fn sync(&self) -> &Arc<Mutex<ChainSync>> {
        &self.sync
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Queue an outbound connection to `address`.
    pub fn dial(&self, address: impl Into<String>) {
        let _ = self.dial_tx.send(address.into());
    }

    /// Accept inbound connections (if `listener` is set) and perform dials
    /// until the dial queue closes.
    pub async fn run(self: Arc<Self>, listener: Option<TcpListener>) {
        let Some(mut dials) = self.dial_rx.lock().take() else {
            warn!("network is already running");
            return;
        };
        if let Some(l) = &listener {
            if let Ok(addr) = l.local_addr() {
                info!(target: "lumen::init", %addr, "P2P server listening");
            }
        }
        loop {
            tokio::select! {
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(self.clone().run_connection(stream, remote, None));
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                address = dials.recv() => match address {
                    Some(address) => {
                        tokio::spawn(self.clone().connect(address));
                    }
                    None => break,
                },
            }
        }
    }

    async fn connect(self: Arc<Self>, address: String) {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(%address, "connect failed: {e}");
                return;
            }
            Err(_) => {
                debug!(%address, "connect timed out");
                return;
            }
        };
        let remote = match stream.peer_addr() {
            Ok(r) => r,
            Err(e) => {
                debug!(%address, "no peer address: {e}");
                return;
            }
        };
        self.run_connection(stream, remote, Some(address)).await;
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr, dialed: Option<String>) {
        let _ = stream.set_nodelay(true);
        let admitted = self.sync.lock().peers_mut().admit(remote, dialed);
        let id = match admitted {
            Ok(id) => id,
            Err(e) => {
                debug!(%remote, "connection refused: {e}");
                return;
            }
        };
        debug!(peer = id, %remote, "peer connected");

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let close = Arc::new(Notify::new());
        self.handles.lock().insert(
            id,
            PeerHandle {
                tx,
                close: close.clone(),
            },
        );
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &msg).await {
                    debug!(peer = id, "write failed: {e}");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let greeting = self.sync.lock().on_connected(id);
        self.dispatch(greeting);

        loop {
            let frame = tokio::select! {
                _ = close.notified() => break,
                frame = read_message(&mut reader, self.max_input_size) => frame,
            };
            match frame {
                Ok(Some(msg)) => {
                    let kind = msg.kind();
                    let handled = self.sync.lock().handle_message(id, msg, now_ms());
                    match handled {
                        Ok(out) => self.dispatch(out),
                        Err(e) => warn!(peer = id, kind, "message handling failed: {e}"),
                    }
                }
                Ok(None) => break,
                Err(P2pError::Codec(e)) => {
                    debug!(peer = id, "skipping malformed message: {e}");
                }
                Err(e) => {
                    debug!(peer = id, "closing connection: {e}");
                    break;
                }
            }
        }

        self.drop_peer(id);
        writer_task.abort();
    }

    fn drop_peer(&self, id: PeerId) {
        if let Some(handle) = self.handles.lock().remove(&id) {
            handle.close.notify_one();
        }
        self.sync.lock().on_disconnected(id);
    }

    fn send(&self, id: PeerId, msg: Message) {
        if let Some(handle) = self.handles.lock().get(&id) {
            let _ = handle.tx.send(msg);
        }
    }

    fn broadcast(&self, msg: &Message, except: Option<PeerId>) {
        for (id, handle) in self.handles.lock().iter() {
            if Some(*id) != except {
                let _ = handle.tx.send(msg.clone());
            }
        }
    }

    /// Perform engine actions.
    ///
    /// Must not be called while the engine lock is held.
    pub fn dispatch(&self, out: Vec<Outbound>) {
        for action in out {
            match action {
                Outbound::Send(id, msg) => self.send(id, msg),
                Outbound::Broadcast(msg) => self.broadcast(&msg, None),
                Outbound::BroadcastExcept(id, msg) => self.broadcast(&msg, Some(id)),
                Outbound::Deliver(envelope) => {
                    let _ = self.deliver.send(envelope);
                }
                Outbound::Disconnect(id) => self.drop_peer(id),
                Outbound::Dial(address) => self.dial(address),
            }
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DEFAULT_QUERY_LIMIT;

    #[tokio::test]
    async fn frames_roundtrip_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::QueryAll {
            from_index: 3,
            limit: DEFAULT_QUERY_LIMIT,
        };
        write_message(&mut a, &msg).await.unwrap();
        write_message(&mut a, &Message::QueryLatest).await.unwrap();
        drop(a);
        assert_eq!(read_message(&mut b, 1024).await.unwrap(), Some(msg));
        assert_eq!(read_message(&mut b, 1024).await.unwrap(), Some(Message::QueryLatest));
        assert_eq!(read_message(&mut b, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::MyPeers {
            peers: vec!["x".repeat(200)],
        };
        write_message(&mut a, &msg).await.unwrap();
        assert!(matches!(
            read_message(&mut b, 64).await,
            Err(P2pError::Oversized { max: 64, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_frame_is_skippable() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let junk = br#"{"type":"NOPE"}"#;
        a.write_all(&(junk.len() as u32).to_be_bytes()).await.unwrap();
        a.write_all(junk).await.unwrap();
        write_message(&mut a, &Message::QueryLatest).await.unwrap();
        assert!(matches!(read_message(&mut b, 1024).await, Err(P2pError::Codec(_))));
        assert_eq!(read_message(&mut b, 1024).await.unwrap(), Some(Message::QueryLatest));
    }
}
