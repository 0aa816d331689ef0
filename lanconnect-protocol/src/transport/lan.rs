//! LAN channel service
//!
//! Discovers peers with UDP identity broadcasts and turns them into
//! authenticated [`Channel`]s:
//!
//! 1. A peer's identity arrives over UDP.
//! 2. The device with the smaller id dials the peer's `tcpPort` and sends its
//!    own identity in plaintext. The other side answers the datagram with a
//!    unicast identity instead of dialling, so only one connection results.
//! 3. TLS runs with inverted roles (the dialler is the TLS server).
//! 4. Identities are exchanged again inside TLS and bound to the certificate
//!    Common Name. The certificate fingerprint decides trust.
//!
//! Handshake failures are logged and the connection is dropped; nothing on
//! this path is fatal to the service.

use super::channel::{Channel, ChannelParts};
use super::tls::{
    accept_tls, connect_tls, exchange_identity, peer_certificate_der, verify_peer_identity,
};
use crate::codec::{read_identity_line, write_packet};
use crate::discovery::{should_initiate, DeviceInfo, BROADCAST_ADDR, DEFAULT_PORT, MAX_IDENTITY_SIZE};
use crate::store::TrustStore;
use crate::{CertificateInfo, Packet, ProtocolError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default interval between identity broadcasts
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Default time allowed for identity exchange and TLS
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 64;

/// Channel service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address for both the UDP socket and the TCP listener
    pub bind_addr: SocketAddr,
    /// Periodic broadcast cadence, `None` to broadcast only on request
    pub broadcast_interval: Option<Duration>,
    pub handshake_timeout: Duration,
    /// Destination port for broadcast identities
    pub broadcast_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            broadcast_interval: Some(DEFAULT_BROADCAST_INTERVAL),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            broadcast_port: DEFAULT_PORT,
        }
    }
}

/// Events emitted by a channel service
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A channel completed its handshake
    ChannelOpened(Arc<Channel>),
    /// A registered channel closed
    ChannelClosed { device_id: String },
    Started,
    Stopped,
}

/// A transport backend producing authenticated channels
#[async_trait]
pub trait ChannelService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bind sockets and start discovery
    async fn start(&self) -> Result<()>;

    /// Stop discovery and close every channel
    async fn stop(&self);

    /// Announce ourselves, to one address or to the whole segment
    async fn broadcast(&self, address: Option<SocketAddr>) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent>;

    /// Snapshot of the open channels
    async fn channels(&self) -> Vec<Arc<Channel>>;

    fn is_active(&self) -> bool;
}

struct Running {
    token: CancellationToken,
    udp: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServiceInner {
    identity: StdRwLock<DeviceInfo>,
    certificate: Arc<CertificateInfo>,
    trust: Arc<dyn TrustStore>,
    config: ServiceConfig,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    pending: Mutex<HashSet<String>>,
    events: broadcast::Sender<ServiceEvent>,
    running: Mutex<Option<Running>>,
    local_addr: StdRwLock<Option<SocketAddr>>,
    active: AtomicBool,
}

/// UDP discovery plus TLS-over-TCP channels
///
/// # Examples
///
/// ```no_run
/// use lanconnect_protocol::discovery::{DeviceInfo, DeviceType};
/// use lanconnect_protocol::store::MemoryTrustStore;
/// use lanconnect_protocol::{CertificateInfo, ChannelService, LanChannelService, ServiceConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> lanconnect_protocol::Result<()> {
/// let identity = DeviceInfo::new("Desktop", DeviceType::Desktop, 1716);
/// let certificate = Arc::new(CertificateInfo::generate(identity.device_id.clone())?);
/// let service = LanChannelService::new(
///     identity,
///     certificate,
///     Arc::new(MemoryTrustStore::new()),
///     ServiceConfig::default(),
/// );
///
/// let mut events = service.subscribe();
/// service.start().await?;
/// while let Ok(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LanChannelService {
    inner: Arc<ServiceInner>,
}

impl LanChannelService {
    pub fn new(
        identity: DeviceInfo,
        certificate: Arc<CertificateInfo>,
        trust: Arc<dyn TrustStore>,
        config: ServiceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ServiceInner {
                identity: StdRwLock::new(identity),
                certificate,
                trust,
                config,
                channels: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                events,
                running: Mutex::new(None),
                local_addr: StdRwLock::new(None),
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Our identity, with `tcpPort` set to the bound port once started
    pub fn identity(&self) -> DeviceInfo {
        self.inner.identity()
    }

    /// Bound address, if started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn channel(&self, device_id: &str) -> Option<Arc<Channel>> {
        self.inner.channels.read().await.get(device_id).cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.channels.read().await.len()
    }
}

#[async_trait]
impl ChannelService for LanChannelService {
    fn name(&self) -> &'static str {
        "lan"
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(ProtocolError::InvalidState(
                "channel service already started".to_string(),
            ));
        }

        let bind_addr = self.inner.config.bind_addr;
        info!("Starting LAN channel service on {}", bind_addr);

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding TCP listener"))?;
        let local_addr = listener.local_addr()?;

        // UDP shares the port the listener ended up on
        let udp = UdpSocket::bind(local_addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding UDP socket"))?;
        udp.set_broadcast(true)?;
        let udp = Arc::new(udp);

        self.inner.set_bound(local_addr);

        let token = CancellationToken::new();
        let mut tasks = vec![
            tokio::spawn(run_udp_listener(
                self.inner.clone(),
                udp.clone(),
                token.clone(),
            )),
            tokio::spawn(run_acceptor(self.inner.clone(), listener, token.clone())),
        ];
        if let Some(period) = self.inner.config.broadcast_interval {
            tasks.push(tokio::spawn(run_broadcaster(
                Arc::downgrade(&self.inner),
                udp.clone(),
                period,
                token.clone(),
            )));
        }

        *running = Some(Running { token, udp, tasks });
        self.inner.active.store(true, Ordering::SeqCst);
        let _ = self.inner.events.send(ServiceEvent::Started);

        info!("LAN channel service listening on {}", local_addr);
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };
        info!("Stopping LAN channel service");

        self.inner.active.store(false, Ordering::SeqCst);
        running.token.cancel();
        join_all(running.tasks).await;
        drop(running.udp);

        let drained: Vec<Arc<Channel>> = self
            .inner
            .channels
            .write()
            .await
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        join_all(drained.iter().map(|channel| channel.close())).await;

        for channel in drained {
            let _ = self.inner.events.send(ServiceEvent::ChannelClosed {
                device_id: channel.device_id().to_string(),
            });
        }

        *self
            .inner
            .local_addr
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        let _ = self.inner.events.send(ServiceEvent::Stopped);
        info!("LAN channel service stopped");
    }

    async fn broadcast(&self, address: Option<SocketAddr>) -> Result<()> {
        let udp = {
            let running = self.inner.running.lock().await;
            match running.as_ref() {
                Some(running) => running.udp.clone(),
                None => {
                    return Err(ProtocolError::InvalidState(
                        "channel service not started".to_string(),
                    ))
                }
            }
        };
        self.inner.send_identity(&udp, address).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    async fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner.channels.read().await.values().cloned().collect()
    }

    fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }
}

impl ServiceInner {
    fn identity(&self) -> DeviceInfo {
        self.identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn device_id(&self) -> String {
        self.identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .device_id
            .clone()
    }

    fn set_bound(&self, addr: SocketAddr) {
        self.identity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .tcp_port = addr.port();
        *self
            .local_addr
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(addr);
    }

    async fn send_identity(&self, udp: &UdpSocket, address: Option<SocketAddr>) -> Result<()> {
        let target = address.unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), self.config.broadcast_port)
        });
        let bytes = self.identity().to_identity_packet().to_bytes()?;
        udp.send_to(&bytes, target)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "sending identity"))?;
        debug!("Sent identity to {}", target);
        Ok(())
    }

    /// React to an identity datagram
    async fn handle_datagram(self: &Arc<Self>, udp: &UdpSocket, data: &[u8], src: SocketAddr) {
        let identity = match Packet::from_bytes(data)
            .and_then(|packet| DeviceInfo::from_identity_packet(&packet))
        {
            Ok(identity) => identity,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", src, e);
                return;
            }
        };

        let local_id = self.device_id();
        if identity.device_id == local_id {
            return;
        }
        if self.channels.read().await.contains_key(&identity.device_id) {
            debug!("Already connected to {}, ignoring identity", identity.device_id);
            return;
        }

        if !should_initiate(&local_id, &identity.device_id) {
            debug!(
                "{} ({}) dials us, answering with our identity",
                identity.device_name, identity.device_id
            );
            if let Err(e) = self.send_identity(udp, Some(src)).await {
                warn!("Failed to answer identity from {}: {}", src, e);
            }
            return;
        }

        if !self.pending.lock().await.insert(identity.device_id.clone()) {
            debug!("Connection to {} already in progress", identity.device_id);
            return;
        }

        let addr = SocketAddr::new(src.ip(), identity.tcp_port);
        info!(
            "Discovered {} ({}) at {}, connecting",
            identity.device_name, identity.device_id, addr
        );

        let inner = self.clone();
        let token = self.running_token().await;
        tokio::spawn(async move {
            let device_id = identity.device_id.clone();
            let result = match token {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => Err(ProtocolError::Cancelled("service stopped".to_string())),
                    result = inner.dial(addr, identity) => result,
                },
                None => Err(ProtocolError::Cancelled("service stopped".to_string())),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.requires_user_action() => warn!(
                    "Connection to {} at {} failed: {}",
                    device_id,
                    addr,
                    e.user_message()
                ),
                Err(e) if e.is_recoverable() => info!(
                    "Connection to {} at {} failed, waiting for its next announcement: {}",
                    device_id, addr, e
                ),
                Err(e) => warn!("Connection to {} at {} failed: {}", device_id, addr, e),
            }
            inner.pending.lock().await.remove(&device_id);
        });
    }

    async fn running_token(&self) -> Option<CancellationToken> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.token.clone())
    }

    /// Outgoing connection: plaintext identity, then TLS as server
    async fn dial(self: &Arc<Self>, addr: SocketAddr, plaintext: DeviceInfo) -> Result<()> {
        let handshake_timeout = self.config.handshake_timeout;
        let mut tcp = timeout(handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting"))?;
        let local_addr = tcp.local_addr()?;

        write_packet(&mut tcp, &self.identity().to_identity_packet()).await?;
        let tls = accept_tls(tcp, &self.certificate, handshake_timeout).await?;

        self.finish_handshake(tls, plaintext, addr, local_addr).await
    }

    /// Incoming connection: read plaintext identity, then TLS as client
    async fn accept(self: &Arc<Self>, mut tcp: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let handshake_timeout = self.config.handshake_timeout;
        let local_addr = tcp.local_addr()?;

        let packet = read_identity_line(&mut tcp, MAX_IDENTITY_SIZE, handshake_timeout).await?;
        let plaintext = DeviceInfo::from_identity_packet(&packet)
            .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))?;

        let local_id = self.device_id();
        if plaintext.device_id == local_id {
            return Err(ProtocolError::HandshakeFailure(
                "peer claims our own device id".to_string(),
            ));
        }
        if !should_initiate(&plaintext.device_id, &local_id) {
            debug!(
                "{} dialled although we have the smaller id",
                plaintext.device_id
            );
        }

        let tls = connect_tls(tcp, &self.certificate, handshake_timeout).await?;
        self.finish_handshake(tls, plaintext, remote_addr, local_addr)
            .await
    }

    async fn finish_handshake<S>(
        self: &Arc<Self>,
        mut tls: SslStream<S>,
        plaintext: DeviceInfo,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer_certificate = peer_certificate_der(&tls)?;
        let local_identity = self.identity();
        let identity = exchange_identity(
            &mut tls,
            &local_identity,
            plaintext,
            self.config.handshake_timeout,
        )
        .await?;
        verify_peer_identity(&peer_certificate, &identity.device_id)?;

        let fingerprint = CertificateInfo::calculate_fingerprint(&peer_certificate);
        let trusted = self.trust.is_trusted(&fingerprint).await;
        debug!(
            "Handshake with {} complete (fingerprint {}, trusted: {})",
            identity.device_id, fingerprint, trusted
        );

        let channel = Arc::new(Channel::new(
            tls,
            ChannelParts {
                identity,
                local_identity,
                local_certificate: self.certificate.clone(),
                peer_certificate,
                trusted,
                remote_addr,
                local_addr,
            },
        ));
        self.register(channel).await;
        Ok(())
    }

    async fn register(self: &Arc<Self>, channel: Arc<Channel>) {
        let device_id = channel.device_id().to_string();
        {
            let mut channels = self.channels.write().await;
            if !self.active.load(Ordering::SeqCst) {
                drop(channels);
                debug!("Service stopped, dropping channel to {}", device_id);
                channel.close().await;
                return;
            }
            if channels.contains_key(&device_id) {
                drop(channels);
                info!("Already connected to {}, dropping duplicate channel", device_id);
                channel.close().await;
                return;
            }
            channels.insert(device_id.clone(), channel.clone());
        }

        info!(
            "Channel opened to {} ({}) via {}",
            channel.identity().device_name,
            device_id,
            channel.address()
        );
        let _ = self.events.send(ServiceEvent::ChannelOpened(channel.clone()));

        let service = Arc::downgrade(self);
        tokio::spawn(watch_channel(service, channel));
    }
}

async fn watch_channel(service: Weak<ServiceInner>, channel: Arc<Channel>) {
    channel.closed().await;
    channel.close().await;

    let Some(service) = service.upgrade() else {
        return;
    };
    let device_id = channel.device_id().to_string();
    let removed = {
        let mut channels = service.channels.write().await;
        match channels.get(&device_id) {
            Some(current) if Arc::ptr_eq(current, &channel) => channels.remove(&device_id),
            _ => None,
        }
    };
    if removed.is_some() {
        info!("Channel to {} closed", device_id);
        let _ = service.events.send(ServiceEvent::ChannelClosed { device_id });
    }
}

async fn run_udp_listener(inner: Arc<ServiceInner>, udp: Arc<UdpSocket>, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_IDENTITY_SIZE];
    loop {
        let (len, src) = tokio::select! {
            _ = token.cancelled() => break,
            result = udp.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    continue;
                }
            },
        };
        inner.handle_datagram(&udp, &buf[..len], src).await;
    }
    debug!("UDP listener stopped");
}

async fn run_acceptor(inner: Arc<ServiceInner>, listener: TcpListener, token: CancellationToken) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = token.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        debug!("Accepted TCP connection from {}", remote_addr);
        let inner = inner.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = inner.accept(stream, remote_addr) => {
                    if let Err(e) = result {
                        warn!("Dropping connection from {}: {}", remote_addr, e);
                    }
                }
            }
        });
    }
    debug!("TCP acceptor stopped");
}

async fn run_broadcaster(
    inner: Weak<ServiceInner>,
    udp: Arc<UdpSocket>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                if let Err(e) = inner.send_identity(&udp, None).await {
                    debug!("Identity broadcast failed: {}", e);
                }
            }
        }
    }
    debug!("Broadcaster stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceType;
    use crate::store::MemoryTrustStore;

    fn service(id: &str) -> LanChannelService {
        let identity = DeviceInfo::with_id(id, id, DeviceType::Desktop, 0);
        let certificate = Arc::new(CertificateInfo::generate(id).unwrap());
        LanChannelService::new(
            identity,
            certificate,
            Arc::new(MemoryTrustStore::new()),
            ServiceConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                broadcast_interval: None,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_start_stop() {
        let service = service("aaaa");
        let mut events = service.subscribe();

        service.start().await.unwrap();
        assert!(service.is_active());
        let addr = service.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(service.identity().tcp_port, addr.port());
        assert!(matches!(events.recv().await.unwrap(), ServiceEvent::Started));

        assert!(service.start().await.is_err());

        service.stop().await;
        assert!(!service.is_active());
        assert!(service.local_addr().is_none());
        assert!(matches!(events.recv().await.unwrap(), ServiceEvent::Stopped));

        // Second stop is a no-op
        service.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_requires_start() {
        let service = service("aaaa");
        assert!(matches!(
            service.broadcast(None).await,
            Err(ProtocolError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_own_identity_on_tcp() {
        let service = service("aaaa");
        service.start().await.unwrap();
        let addr = service.local_addr().unwrap();

        let mut tcp = TcpStream::connect(addr).await.unwrap();
        write_packet(&mut tcp, &service.identity().to_identity_packet())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), tokio::io::AsyncReadExt::read(&mut tcp, &mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(read, 0);
        assert_eq!(service.channel_count().await, 0);

        service.stop().await;
    }
}
