//! Packet framing over byte streams
//!
//! Packets are newline-delimited JSON. [`FrameReader`] turns any async byte
//! stream into a sequence of packets and keeps partially received frames
//! across calls, so a cancelled read never loses bytes.
//!
//! The plaintext identity that precedes a TLS handshake must be read with
//! [`read_identity_line`] instead: it consumes the stream one byte at a time
//! and never buffers past the newline, leaving the TLS ClientHello intact.

use crate::{Packet, ProtocolError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, warn};

/// Maximum packet size (10MB)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Time allowed for the rest of a frame once its first byte has arrived
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(30);

/// Incremental newline-delimited packet decoder
pub struct FrameReader<R> {
    reader: BufReader<R>,
    partial: Vec<u8>,
    /// When the frame in `partial` must be complete
    deadline: Option<Instant>,
    max_size: usize,
    frame_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, MAX_PACKET_SIZE, FRAME_TIMEOUT)
    }

    pub fn with_limits(inner: R, max_size: usize, frame_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(inner),
            partial: Vec::new(),
            deadline: None,
            max_size,
            frame_timeout,
        }
    }

    /// Read the next complete packet
    ///
    /// Suspends until a whole frame is available. Returns `Ok(None)` when the
    /// stream ends cleanly between frames.
    ///
    /// # Errors
    ///
    /// - `MalformedFrame` if the frame is not a packet, the stream ends
    ///   mid-frame, or the remainder of a frame does not arrive in time
    /// - `PacketSizeExceeded` if a frame grows beyond the size limit
    /// - `Io` for transport errors
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let (complete, used) = {
                let available = match self.deadline {
                    None => self.reader.fill_buf().await?,
                    Some(deadline) => match timeout_at(deadline, self.reader.fill_buf()).await {
                        Ok(result) => result?,
                        Err(_) => {
                            let received = self.partial.len();
                            self.partial.clear();
                            self.deadline = None;
                            return Err(ProtocolError::MalformedFrame(format!(
                                "frame incomplete after {:?} ({} bytes received)",
                                self.frame_timeout, received
                            )));
                        }
                    },
                };

                if available.is_empty() {
                    if self.partial.is_empty() {
                        return Ok(None);
                    }
                    let received = self.partial.len();
                    self.partial.clear();
                    self.deadline = None;
                    return Err(ProtocolError::MalformedFrame(format!(
                        "stream ended inside a frame ({} bytes received)",
                        received
                    )));
                }

                match available.iter().position(|b| *b == b'\n') {
                    Some(index) => {
                        self.partial.extend_from_slice(&available[..=index]);
                        (true, index + 1)
                    }
                    None => {
                        self.partial.extend_from_slice(available);
                        (false, available.len())
                    }
                }
            };
            self.reader.consume(used);
            if self.deadline.is_none() && !self.partial.is_empty() {
                self.deadline = Some(Instant::now() + self.frame_timeout);
            }

            if self.partial.len() > self.max_size {
                let size = self.partial.len();
                self.partial.clear();
                self.deadline = None;
                return Err(ProtocolError::PacketSizeExceeded(size, self.max_size));
            }

            if !complete {
                continue;
            }

            let frame = std::mem::take(&mut self.partial);
            self.deadline = None;
            if frame.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return match Packet::from_bytes(&frame) {
                Ok(packet) => Ok(Some(packet)),
                Err(e) => {
                    warn!("Discarding malformed frame ({} bytes): {}", frame.len(), e);
                    Err(ProtocolError::MalformedFrame(e.to_string()))
                }
            };
        }
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

/// Read a single packet without buffering past its terminating newline
pub async fn read_identity_line<S>(
    stream: &mut S,
    max_size: usize,
    read_timeout: Duration,
) -> Result<Packet>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let mut byte_buf = [0u8; 1];

    loop {
        match timeout(read_timeout, stream.read(&mut byte_buf)).await {
            Ok(Ok(0)) => {
                return Err(ProtocolError::HandshakeFailure(format!(
                    "connection closed after {} bytes of identity",
                    bytes.len()
                )));
            }
            Ok(Ok(_)) => {
                if byte_buf[0] == b'\n' {
                    if bytes.iter().all(|b: &u8| b.is_ascii_whitespace()) {
                        bytes.clear();
                        continue;
                    }
                    break;
                }
                bytes.push(byte_buf[0]);
                if bytes.len() > max_size {
                    return Err(ProtocolError::PacketSizeExceeded(bytes.len(), max_size));
                }
            }
            Ok(Err(e)) => return Err(ProtocolError::Io(e)),
            Err(_) => {
                return Err(ProtocolError::HandshakeFailure(
                    "timed out waiting for identity".to_string(),
                ));
            }
        }
    }

    debug!("Read identity frame ({} bytes)", bytes.len());
    Packet::from_bytes(&bytes).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

/// Write one packet frame and flush
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(packet)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a packet, enforcing the frame size limit
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>> {
    let bytes = packet.to_bytes()?;
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketSizeExceeded(bytes.len(), MAX_PACKET_SIZE));
    }
    Ok(bytes)
}
