//! Authenticated packet channel to one peer
//!
//! A [`Channel`] owns an established (normally TLS) stream. Writes are queued
//! to a dedicated writer task so concurrent senders never interleave frames;
//! reads go through a [`FrameReader`] that the device's read loop drives.

use crate::codec::{encode_frame, FrameReader};
use crate::discovery::DeviceInfo;
use crate::{CertificateInfo, Packet, ProtocolError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// How long `close()` waits for queued writes to drain
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Commands handled by the writer task
enum WriteCommand {
    /// Write a frame and report the result
    Packet(Vec<u8>, oneshot::Sender<Result<()>>),
    /// Flush, shut down the stream and exit
    Close,
}

/// Everything known about a channel once its handshake has completed
#[derive(Debug, Clone)]
pub struct ChannelParts {
    /// Identity the peer sent over the encrypted stream
    pub identity: DeviceInfo,
    pub local_identity: DeviceInfo,
    pub local_certificate: Arc<CertificateInfo>,
    /// DER certificate the peer presented
    pub peer_certificate: Vec<u8>,
    pub trusted: bool,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

fn closed_error() -> ProtocolError {
    ProtocolError::NetworkError("channel closed".to_string())
}

/// Established packet channel
pub struct Channel {
    identity: DeviceInfo,
    local_identity: DeviceInfo,
    local_certificate: Arc<CertificateInfo>,
    peer_certificate: Vec<u8>,
    fingerprint: String,
    trusted: AtomicBool,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,

    reader: Mutex<Option<FrameReader<BoxedReader>>>,
    command_tx: mpsc::UnboundedSender<WriteCommand>,
    writer_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    closed: Arc<watch::Sender<bool>>,
}

impl Channel {
    /// Wrap an established stream
    ///
    /// Must be called inside a tokio runtime: the writer task is spawned here.
    pub fn new<S>(stream: S, parts: ChannelParts) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let writer_task = tokio::spawn(run_writer(
            write_half,
            command_rx,
            closed.clone(),
            parts.identity.device_id.clone(),
        ));

        let fingerprint = CertificateInfo::calculate_fingerprint(&parts.peer_certificate);
        let reader: BoxedReader = Box::new(read_half);

        Self {
            identity: parts.identity,
            local_identity: parts.local_identity,
            local_certificate: parts.local_certificate,
            peer_certificate: parts.peer_certificate,
            fingerprint,
            trusted: AtomicBool::new(parts.trusted),
            remote_addr: parts.remote_addr,
            local_addr: parts.local_addr,
            reader: Mutex::new(Some(FrameReader::new(reader))),
            command_tx,
            writer_task: std::sync::Mutex::new(Some(writer_task)),
            closing: AtomicBool::new(false),
            closed,
        }
    }

    /// Queue a packet and wait until it has been written
    ///
    /// Packets sent from one task are written in the order they were sent.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }

        let bytes = encode_frame(packet)?;
        debug!(
            "Sending packet '{}' ({} bytes) to {}",
            packet.packet_type,
            bytes.len(),
            self.identity.device_id
        );

        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(WriteCommand::Packet(bytes, ack_tx))
            .map_err(|_| closed_error())?;
        ack_rx.await.map_err(|_| closed_error())?
    }

    /// Read the next packet from the peer
    ///
    /// Resolves with `NetworkError` as soon as the channel closes. A frame
    /// error that desynchronizes the stream closes the channel.
    pub async fn read_packet(&self) -> Result<Packet> {
        if self.is_closed() {
            return Err(closed_error());
        }

        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(closed_error());
        };

        let mut closed_rx = self.closed.subscribe();
        let result = tokio::select! {
            result = reader.next_packet() => result,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(closed_error()),
        };
        drop(guard);

        match result {
            Ok(Some(packet)) => {
                debug!(
                    "Received packet '{}' from {}",
                    packet.packet_type, self.identity.device_id
                );
                Ok(packet)
            }
            Ok(None) => {
                info!("Peer {} closed the channel", self.identity.device_id);
                self.close().await;
                Err(closed_error())
            }
            Err(e) => {
                warn!("Read error from {}: {}", self.identity.device_id, e);
                if e.closes_channel() {
                    self.close().await;
                }
                Err(e)
            }
        }
    }

    /// Close the channel
    ///
    /// Queued writes are drained (bounded by [`CLOSE_TIMEOUT`]) before the
    /// stream is shut down. Pending reads resolve immediately. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing channel to {}", self.identity.device_id);

        self.closed.send_replace(true);
        let _ = self.command_tx.send(WriteCommand::Close);

        let task = self
            .writer_task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(mut task) = task {
            if timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!(
                    "Writer for {} did not drain within {:?}, aborting",
                    self.identity.device_id, CLOSE_TIMEOUT
                );
                task.abort();
            }
        }

        // Dropping the read half releases the socket
        self.reader.lock().await.take();
    }

    /// Resolves once the channel has closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Identity of the peer
    pub fn identity(&self) -> &DeviceInfo {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn peer_certificate(&self) -> &[u8] {
        &self.peer_certificate
    }

    /// SHA256 fingerprint of the peer certificate
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whether the peer certificate was trusted when the channel opened
    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.trusted.store(trusted, Ordering::SeqCst);
    }

    /// Address the peer declared, as `lan://<ip>:<port>`
    pub fn address(&self) -> String {
        format!("lan://{}:{}", self.remote_addr.ip(), self.identity.tcp_port)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_certificate(&self) -> &Arc<CertificateInfo> {
        &self.local_certificate
    }

    pub fn local_identity(&self) -> &DeviceInfo {
        &self.local_identity
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("device_id", &self.identity.device_id)
            .field("remote_addr", &self.remote_addr)
            .field("trusted", &self.is_trusted())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut command_rx: mpsc::UnboundedReceiver<WriteCommand>,
    closed: Arc<watch::Sender<bool>>,
    device_id: String,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = command_rx.recv().await {
        match command {
            WriteCommand::Packet(bytes, ack) => {
                let result = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;

                match result {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        warn!("Write to {} failed: {}", device_id, e);
                        let _ = ack.send(Err(ProtocolError::Io(e)));
                        closed.send_replace(true);
                        break;
                    }
                }
            }
            WriteCommand::Close => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of channel to {} failed: {}", device_id, e);
    }
    debug!("Writer for {} stopped", device_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceType;
    use serde_json::json;
    use tokio::io::{duplex, AsyncReadExt};

    fn parts(peer_id: &str, cert: Arc<CertificateInfo>) -> ChannelParts {
        ChannelParts {
            identity: DeviceInfo::with_id(peer_id, "Peer", DeviceType::Phone, 1716),
            local_identity: DeviceInfo::with_id("local", "Local", DeviceType::Desktop, 1716),
            local_certificate: cert.clone(),
            peer_certificate: cert.certificate.clone(),
            trusted: false,
            remote_addr: "192.168.1.20:40000".parse().unwrap(),
            local_addr: "192.168.1.10:1716".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_send_and_read() {
        let cert = Arc::new(CertificateInfo::generate("local").unwrap());
        let (a, b) = duplex(64 * 1024);
        let left = Channel::new(a, parts("right", cert.clone()));
        let right = Channel::new(b, parts("left", cert));

        let packet = Packet::new("kdeconnect.ping", json!({"message": "hello"}));
        left.send_packet(&packet).await.unwrap();

        let received = right.read_packet().await.unwrap();
        assert_eq!(received, packet);
        assert_eq!(left.address(), "lan://192.168.1.20:1716");
    }

    #[tokio::test]
    async fn test_close_resolves_pending_read() {
        let cert = Arc::new(CertificateInfo::generate("local").unwrap());
        let (a, _b) = duplex(1024);
        let channel = Arc::new(Channel::new(a, parts("peer", cert)));

        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.read_packet().await })
        };
        tokio::task::yield_now().await;

        channel.close().await;
        assert!(channel.is_closed());
        assert!(matches!(
            reader.await.unwrap(),
            Err(ProtocolError::NetworkError(_))
        ));

        // Idempotent, and sends fail afterwards
        channel.close().await;
        assert!(channel
            .send_packet(&Packet::new("kdeconnect.ping", json!({})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_drains_queued_writes() {
        let cert = Arc::new(CertificateInfo::generate("local").unwrap());
        let (a, mut b) = duplex(64 * 1024);
        let channel = Channel::new(a, parts("peer", cert));

        for i in 0..3 {
            channel
                .send_packet(&Packet::with_id(i, "kdeconnect.ping", json!({})))
                .await
                .unwrap();
        }
        channel.close().await;

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        let frames: Vec<_> = raw.split(|b| *b == b'\n').filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
    }

    #[tokio::test]
    async fn test_peer_eof_closes_channel() {
        let cert = Arc::new(CertificateInfo::generate("local").unwrap());
        let (a, b) = duplex(1024);
        let channel = Channel::new(a, parts("peer", cert));
        drop(b);

        assert!(channel.read_packet().await.is_err());
        assert!(channel.is_closed());
        channel.closed().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_channel() {
        let cert = Arc::new(CertificateInfo::generate("local").unwrap());
        let (a, mut b) = duplex(1024);
        let channel = Channel::new(a, parts("peer", cert));

        b.write_all(b"this is not json\n").await.unwrap();
        assert!(matches!(
            channel.read_packet().await,
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(channel.is_closed());
    }
}
