//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use lanconnect_protocol::notification::ChannelNotifier;
use lanconnect_protocol::plugins::{
    ActionParameter, ActionSpec, ParameterShape, Plugin, PluginContext, PluginFactory,
    PluginMetadata, PluginRegistry,
};
use lanconnect_protocol::store::{MemoryCacheStore, MemoryTrustStore};
use lanconnect_protocol::transport::ChannelParts;
use lanconnect_protocol::{
    CertificateInfo, Channel, DeviceEvent, DeviceInfo, DeviceType, LocalContext, Notification,
    Packet, Result, TransferConfig,
};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::duplex;
use tokio::sync::{broadcast, mpsc};

pub const LOCAL_ID: &str = "local_device";
pub const PEER_ID: &str = "peer_device";

/// How long a test waits for something asynchronous to happen
pub const WAIT: Duration = Duration::from_secs(5);

pub fn identity(id: &str, name: &str, device_type: DeviceType) -> DeviceInfo {
    DeviceInfo::with_id(id, name, device_type, 1716)
}

/// Peer identity that sends and receives every given packet type
pub fn peer_with(capabilities: &[&str]) -> DeviceInfo {
    let capabilities: Vec<String> = capabilities.iter().map(|s| s.to_string()).collect();
    identity(PEER_ID, "Peer Phone", DeviceType::Phone)
        .with_incoming_capabilities(capabilities.clone())
        .with_outgoing_capabilities(capabilities)
}

/// Local side of a device under test, with observable stores
pub struct Local {
    pub context: LocalContext,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub trust: Arc<MemoryTrustStore>,
    pub cache: Arc<MemoryCacheStore>,
}

pub fn local_with(registry: PluginRegistry) -> Local {
    let (notifier, notifications) = ChannelNotifier::new();
    let trust = Arc::new(MemoryTrustStore::new());
    let cache = Arc::new(MemoryCacheStore::new());
    let context = LocalContext::new(identity(LOCAL_ID, "Local Desktop", DeviceType::Desktop), registry)
        .with_notifier(Arc::new(notifier))
        .with_trust_store(trust.clone())
        .with_cache_store(cache.clone())
        .with_transfer_config(TransferConfig::ephemeral());
    Local {
        context,
        notifications,
        trust,
        cache,
    }
}

/// Two ends of an in-memory channel
///
/// `local` is the end a device under test attaches (its identity is the
/// peer's); `peer` is the end the test drives.
pub struct ChannelPair {
    pub local: Arc<Channel>,
    pub peer: Arc<Channel>,
}

pub fn channel_pair(local: &DeviceInfo, peer: &DeviceInfo, trusted: bool) -> ChannelPair {
    let local_cert = Arc::new(CertificateInfo::generate(local.device_id.clone()).unwrap());
    let peer_cert = Arc::new(CertificateInfo::generate(peer.device_id.clone()).unwrap());
    let loopback: SocketAddr = "127.0.0.1:1716".parse().unwrap();
    let (left, right) = duplex(256 * 1024);

    let local_end = Channel::new(
        left,
        ChannelParts {
            identity: peer.clone(),
            local_identity: local.clone(),
            local_certificate: local_cert.clone(),
            peer_certificate: peer_cert.certificate.clone(),
            trusted,
            remote_addr: loopback,
            local_addr: loopback,
        },
    );
    let peer_end = Channel::new(
        right,
        ChannelParts {
            identity: local.clone(),
            local_identity: peer.clone(),
            local_certificate: peer_cert,
            peer_certificate: local_cert.certificate.clone(),
            trusted,
            remote_addr: loopback,
            local_addr: loopback,
        },
    );

    ChannelPair {
        local: Arc::new(local_end),
        peer: Arc::new(peer_end),
    }
}

/// Read packets on `channel` until one of `packet_type` arrives
pub async fn expect_packet(channel: &Channel, packet_type: &str) -> Packet {
    tokio::time::timeout(WAIT, async {
        loop {
            let packet = channel.read_packet().await.unwrap();
            if packet.is_type(packet_type) {
                return packet;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no '{}' packet arrived", packet_type))
}

pub async fn expect_event(
    events: &mut broadcast::Receiver<DeviceEvent>,
    wanted: impl Fn(&DeviceEvent) -> bool,
) -> DeviceEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected device event did not arrive")
}

pub async fn expect_notification(
    notifications: &mut mpsc::UnboundedReceiver<Notification>,
    wanted: impl Fn(&Notification) -> bool,
) -> Notification {
    tokio::time::timeout(WAIT, async {
        loop {
            let notification = notifications.recv().await.unwrap();
            if wanted(&notification) {
                return notification;
            }
        }
    })
    .await
    .expect("expected notification did not arrive")
}

/// Poll `check` until it returns true
pub async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---- recording plugin ----

pub const PACKET_TYPE_FOO: &str = "kdeconnect.foo";
pub const PACKET_TYPE_BAR: &str = "kdeconnect.bar";

pub static RECORDER_METADATA: PluginMetadata = PluginMetadata {
    id: "recorder",
    label: "Recorder",
    description: "Records every hook call",
    incoming: &[PACKET_TYPE_FOO, PACKET_TYPE_BAR],
    outgoing: &[PACKET_TYPE_FOO, PACKET_TYPE_BAR],
    actions: &[
        ActionSpec {
            name: "foo",
            label: "Foo",
            parameter: ParameterShape::Dict,
            incoming: &[PACKET_TYPE_FOO],
            outgoing: &[PACKET_TYPE_FOO],
        },
        ActionSpec {
            name: "bar",
            label: "Bar",
            parameter: ParameterShape::Bool,
            incoming: &[],
            outgoing: &[PACKET_TYPE_BAR],
        },
        ActionSpec {
            name: "baz",
            label: "Baz",
            parameter: ParameterShape::None,
            incoming: &[],
            outgoing: &[],
        },
    ],
};

/// Shared log of hook calls
#[derive(Clone, Default)]
pub struct Recording(Arc<Mutex<Vec<String>>>);

impl Recording {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == entry)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

struct RecorderPlugin {
    recording: Recording,
}

#[async_trait]
impl Plugin for RecorderPlugin {
    fn metadata(&self) -> &'static PluginMetadata {
        &RECORDER_METADATA
    }

    async fn connected(&mut self, ctx: &PluginContext) -> Result<()> {
        self.recording.push("connected");
        self.cache_properties(ctx, &["data"]).await?;
        Ok(())
    }

    async fn disconnected(&mut self, _ctx: &PluginContext) -> Result<()> {
        self.recording.push("disconnected");
        Ok(())
    }

    async fn destroy(&mut self, _ctx: &PluginContext) -> Result<()> {
        self.recording.push("destroy");
        Ok(())
    }

    async fn handle_packet(&mut self, _ctx: &PluginContext, packet: &Packet) -> Result<()> {
        self.recording.push(format!("packet:{}", packet.packet_type));
        Ok(())
    }

    async fn activate(
        &mut self,
        ctx: &PluginContext,
        action: &str,
        param: ActionParameter,
    ) -> Result<()> {
        self.recording.push(format!(
            "activate:{}:{}",
            action,
            param.map(|p| p.to_string()).unwrap_or_default()
        ));
        if action == "foo" {
            ctx.send_packet(Packet::new(PACKET_TYPE_FOO, serde_json::json!({})))
                .await?;
        }
        Ok(())
    }

    fn cache_loaded(&mut self, values: &Map<String, Value>) {
        let data = values
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or("none")
            .to_string();
        self.recording.push(format!("cache_loaded:{}", data));
    }
}

pub struct RecorderFactory(pub Recording);

impl PluginFactory for RecorderFactory {
    fn metadata(&self) -> &'static PluginMetadata {
        &RECORDER_METADATA
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(RecorderPlugin {
            recording: self.0.clone(),
        })
    }
}

pub fn recorder_registry() -> (PluginRegistry, Recording) {
    let recording = Recording::default();
    let mut registry = PluginRegistry::new();
    registry
        .register_factory(Arc::new(RecorderFactory(recording.clone())))
        .unwrap();
    (registry, recording)
}
