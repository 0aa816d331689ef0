//! Payload transfers
//!
//! Payload bytes never travel on the packet channel. The sender opens a TCP
//! listener, announces its port in `payloadTransferInfo`, and streams the
//! bytes over a separate TLS connection:
//!
//! 1. Uploader binds a port in the transfer range (1739-1764 by default)
//! 2. Uploader sends the packet with `payloadSize` and `payloadTransferInfo`
//! 3. Downloader connects to the uploader's IP and that port
//! 4. TLS runs with the uploader as server; both sides check that the peer
//!    certificate is the one their channel was authenticated with
//! 5. Raw bytes are streamed, then the uploader sends TLS close_notify
//!
//! A transfer is complete only if the stream ends cleanly after exactly the
//! announced number of bytes.

use crate::transport::tls::{accept_tls, connect_tls, peer_certificate_der};
use crate::transport::Channel;
use crate::{CertificateInfo, Packet, ProtocolError, Result};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for the peer to connect and complete TLS
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for any single read or write
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffer size for payload streaming (64KB)
const BUFFER_SIZE: usize = 65536;

/// How long the uploader keeps the socket open after close_notify
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

/// Default transfer port range
pub const TRANSFER_PORT_START: u16 = 1739;
pub const TRANSFER_PORT_END: u16 = 1764;

/// Transfer listener configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// First port to try; 0 lets the OS pick
    pub port_start: u16,
    pub port_end: u16,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port_start: TRANSFER_PORT_START,
            port_end: TRANSFER_PORT_END,
        }
    }
}

impl TransferConfig {
    /// Let the OS choose the port
    pub fn ephemeral() -> Self {
        Self {
            port_start: 0,
            port_end: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

enum TransferKind {
    Upload {
        listener: TcpListener,
        source: Box<dyn AsyncRead + Send + Unpin>,
    },
    Download {
        port: u16,
        sink: Box<dyn AsyncWrite + Send + Unpin>,
    },
}

/// A single payload transfer bound to a channel
pub struct Transfer {
    channel: Arc<Channel>,
    packet: Packet,
    expected: Option<u64>,
    cancel: CancellationToken,
    kind: TransferKind,
}

impl Transfer {
    /// Prepare an upload of `source` alongside `packet`
    ///
    /// Binds the listener immediately and fills in `payloadSize` and
    /// `payloadTransferInfo`. Nothing is sent until [`Transfer::start`].
    pub async fn upload<R>(
        channel: Arc<Channel>,
        packet: Packet,
        source: R,
        size: Option<u64>,
        config: &TransferConfig,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let listener = bind_in_range(channel.local_addr(), config).await?;
        let port = listener.local_addr()?.port();

        let mut info = HashMap::new();
        info.insert("port".to_string(), json!(port));
        let packet = packet
            .with_payload_size(size.map(|s| s as i64).unwrap_or(-1))
            .with_payload_transfer_info(info);

        debug!(
            "Prepared upload of '{}' to {} on port {}",
            packet.packet_type,
            channel.device_id(),
            port
        );

        Ok(Self {
            channel,
            packet,
            expected: size,
            cancel: CancellationToken::new(),
            kind: TransferKind::Upload {
                listener,
                source: Box::new(source),
            },
        })
    }

    /// Prepare a download of the payload announced by `packet`
    pub fn download<W>(channel: Arc<Channel>, packet: Packet, sink: W) -> Result<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let port = packet.payload_port().ok_or_else(|| {
            ProtocolError::InvalidPacket("packet carries no payload port".to_string())
        })?;
        let expected = packet
            .payload_size
            .and_then(|size| u64::try_from(size).ok());

        Ok(Self {
            channel,
            packet,
            expected,
            cancel: CancellationToken::new(),
            kind: TransferKind::Download {
                port,
                sink: Box::new(sink),
            },
        })
    }

    pub fn direction(&self) -> TransferDirection {
        match self.kind {
            TransferKind::Upload { .. } => TransferDirection::Upload,
            TransferKind::Download { .. } => TransferDirection::Download,
        }
    }

    /// The packet as sent (upload) or received (download)
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected
    }

    /// Token that cancels this transfer when triggered
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the transfer to completion
    ///
    /// Returns the number of payload bytes moved. Resolves with `Cancelled`
    /// if the transfer is cancelled or its channel closes first.
    pub async fn start(self) -> Result<u64> {
        let channel = self.channel.clone();
        let cancel = self.cancel.clone();
        let device_id = channel.device_id().to_string();
        let direction = self.direction();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled("transfer cancelled".to_string())),
            _ = channel.closed() => Err(ProtocolError::Cancelled("channel closed".to_string())),
            result = self.run() => result,
        };

        match &result {
            Ok(bytes) => info!("{:?} of {} bytes with {} complete", direction, bytes, device_id),
            Err(e) => warn!("{:?} with {} failed: {}", direction, device_id, e),
        }
        result
    }

    async fn run(self) -> Result<u64> {
        let Transfer {
            channel,
            packet,
            expected,
            kind,
            ..
        } = self;

        match kind {
            TransferKind::Upload {
                listener,
                mut source,
            } => {
                channel.send_packet(&packet).await?;

                let (tcp, remote_addr) = timeout(CONNECTION_TIMEOUT, listener.accept())
                    .await
                    .map_err(|_| {
                        ProtocolError::Timeout("peer did not connect for payload".to_string())
                    })??;
                drop(listener);
                debug!("Payload connection from {}", remote_addr);

                let mut tls = accept_tls(tcp, channel.local_certificate(), CONNECTION_TIMEOUT).await?;
                verify_transfer_peer(&tls, &channel)?;

                let sent = copy_payload(&mut source, &mut tls, expected).await?;

                timeout(TRANSFER_TIMEOUT, tls.shutdown())
                    .await
                    .map_err(|_| ProtocolError::TransferAborted("shutdown timed out".to_string()))?
                    .map_err(|e| ProtocolError::TransferAborted(format!("shutdown failed: {}", e)))?;
                linger(&mut tls).await;

                Ok(sent)
            }
            TransferKind::Download { port, mut sink } => {
                let addr = SocketAddr::new(channel.remote_addr().ip(), port);
                let tcp = timeout(CONNECTION_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
                    .map_err(|e| ProtocolError::from_io_error(e, "connecting for payload"))?;

                let mut tls = connect_tls(tcp, channel.local_certificate(), CONNECTION_TIMEOUT).await?;
                verify_transfer_peer(&tls, &channel)?;

                let received = copy_payload(&mut tls, &mut sink, expected).await?;
                sink.shutdown()
                    .await
                    .map_err(|e| ProtocolError::TransferAborted(format!("closing sink: {}", e)))?;

                Ok(received)
            }
        }
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("direction", &self.direction())
            .field("device_id", &self.channel.device_id())
            .field("packet_type", &self.packet.packet_type)
            .field("expected", &self.expected)
            .finish()
    }
}

async fn bind_in_range(local: SocketAddr, config: &TransferConfig) -> Result<TcpListener> {
    let ip = local.ip();
    if config.port_start == 0 {
        return Ok(TcpListener::bind(SocketAddr::new(ip, 0)).await?);
    }
    if config.port_start > config.port_end {
        return Err(ProtocolError::Configuration(format!(
            "payload port range {}-{} is empty",
            config.port_start, config.port_end
        )));
    }

    for port in config.port_start..=config.port_end {
        if let Ok(listener) = TcpListener::bind(SocketAddr::new(ip, port)).await {
            return Ok(listener);
        }
    }

    Err(ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!(
            "all payload ports in range {}-{} are in use",
            config.port_start, config.port_end
        ),
    )))
}

fn verify_transfer_peer<S>(tls: &SslStream<S>, channel: &Channel) -> Result<()> {
    let certificate = peer_certificate_der(tls)?;
    let fingerprint = CertificateInfo::calculate_fingerprint(&certificate);
    if fingerprint != channel.fingerprint() {
        return Err(ProtocolError::HandshakeFailure(format!(
            "payload peer certificate {} does not match channel {}",
            fingerprint,
            channel.fingerprint()
        )));
    }
    Ok(())
}

/// Give the peer a moment to read close_notify before the socket drops
async fn linger<S: AsyncRead + Unpin>(stream: &mut S) {
    let mut buf = [0u8; 512];
    let _ = timeout(LINGER_TIMEOUT, async {
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

/// Copy a payload, enforcing the announced size
///
/// With `expected` set, more bytes than announced is `SizeMismatch` and fewer
/// is `TransferAborted`. Without it, everything up to a clean end of stream
/// is accepted. Read and write errors abort the transfer.
pub async fn copy_payload<R, W>(reader: &mut R, writer: &mut W, expected: Option<u64>) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match timeout(TRANSFER_TIMEOUT, reader.read(&mut buffer)).await {
            Err(_) => {
                return Err(ProtocolError::TransferAborted(format!(
                    "read timed out after {} bytes",
                    total
                )))
            }
            Ok(Err(e)) => {
                return Err(ProtocolError::TransferAborted(format!(
                    "read failed after {} bytes: {}",
                    total, e
                )))
            }
            Ok(Ok(read)) => read,
        };
        if read == 0 {
            break;
        }

        let received = total + read as u64;
        if let Some(expected) = expected {
            if received > expected {
                return Err(ProtocolError::SizeMismatch { expected, received });
            }
        }

        timeout(TRANSFER_TIMEOUT, writer.write_all(&buffer[..read]))
            .await
            .map_err(|_| {
                ProtocolError::TransferAborted(format!("write timed out after {} bytes", total))
            })?
            .map_err(|e| {
                ProtocolError::TransferAborted(format!("write failed after {} bytes: {}", total, e))
            })?;

        total = received;
    }

    if let Some(expected) = expected {
        if total < expected {
            return Err(ProtocolError::TransferAborted(format!(
                "stream ended after {} of {} bytes",
                total, expected
            )));
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| ProtocolError::TransferAborted(format!("flush failed: {}", e)))?;

    Ok(total)
}
