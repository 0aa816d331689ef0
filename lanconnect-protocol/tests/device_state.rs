//! Device connection and pairing state machine over in-memory channels

mod common;

use async_trait::async_trait;
use common::*;
use lanconnect_protocol::plugins::{
    ActionParameter, ActionSpec, ParameterShape, Plugin, PluginContext, PluginFactory,
    PluginMetadata, PluginRegistry,
};
use lanconnect_protocol::store::TrustStore;
use lanconnect_protocol::{
    Device, DeviceEvent, DeviceOptions, Notification, Packet, PairingPacket, PairingStatus,
    ProtocolError, Result,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn recorder_peer() -> lanconnect_protocol::DeviceInfo {
    peer_with(&[PACKET_TYPE_FOO, PACKET_TYPE_BAR])
}

#[tokio::test]
async fn test_unpaired_packets_never_reach_plugins() {
    let (registry, recording) = recorder_registry();
    let mut local = local_with(registry);
    let peer = recorder_peer();
    let device = Device::new(peer.clone(), local.context.clone(), DeviceOptions::default());
    let pair = channel_pair(&local.context.identity, &peer, false);

    device.attach_channel(pair.local.clone()).await.unwrap();
    assert!(device.is_connected());
    assert!(!device.is_paired());

    pair.peer
        .send_packet(&Packet::new(PACKET_TYPE_FOO, json!({})))
        .await
        .unwrap();
    let dropped = expect_notification(&mut local.notifications, |n| {
        matches!(n, Notification::PairingRequired { .. })
    })
    .await;
    assert_eq!(
        dropped,
        Notification::PairingRequired {
            device_id: PEER_ID.to_string(),
            packet_type: PACKET_TYPE_FOO.to_string(),
        }
    );
    assert_eq!(recording.count("packet:"), 0);
    assert!(!recording.contains("connected"));

    // Pair at the peer's request, then the same packet is delivered
    pair.peer.send_packet(&PairingPacket::request()).await.unwrap();
    expect_notification(&mut local.notifications, |n| {
        matches!(n, Notification::PairingRequest { .. })
    })
    .await;
    assert_eq!(device.pairing_status().await, PairingStatus::RequestedByPeer);

    device.accept_pairing().await.unwrap();
    let accepted = expect_packet(&pair.peer, "kdeconnect.pair").await;
    assert_eq!(accepted.get_body_field::<bool>("pair"), Some(true));
    assert!(device.is_paired());
    assert!(recording.contains("connected"));

    pair.peer
        .send_packet(&Packet::new(PACKET_TYPE_FOO, json!({})))
        .await
        .unwrap();
    eventually(|| recording.count("packet:") == 1).await;
}

#[tokio::test]
async fn test_pairing_timeout_reverts_and_disables_actions() {
    let (registry, recording) = recorder_registry();
    let mut local = local_with(registry);
    let peer = recorder_peer();
    let device = Device::new(
        peer.clone(),
        local.context.clone(),
        DeviceOptions {
            pairing_timeout: Duration::from_millis(300),
        },
    );
    let mut events = device.subscribe();
    let pair = channel_pair(&local.context.identity, &peer, false);
    device.attach_channel(pair.local.clone()).await.unwrap();

    device.request_pairing().await.unwrap();
    let request = expect_packet(&pair.peer, "kdeconnect.pair").await;
    assert_eq!(request.get_body_field::<bool>("pair"), Some(true));
    assert_eq!(device.pairing_status().await, PairingStatus::Requested);

    expect_event(&mut events, |e| *e == DeviceEvent::PairingTimedOut).await;
    assert_eq!(device.pairing_status().await, PairingStatus::Unpaired);
    assert!(!device.is_paired());
    assert!(device.actions().await.iter().all(|action| !action.enabled));
    assert!(!recording.contains("connected"));

    let failed = expect_notification(&mut local.notifications, |n| {
        matches!(n, Notification::PairingFailed { .. })
    })
    .await;
    assert_eq!(failed.device_id(), PEER_ID);

    // A late acceptance after the timeout is a fresh request from the peer
    pair.peer.send_packet(&PairingPacket::accept()).await.unwrap();
    expect_event(&mut events, |e| {
        *e == DeviceEvent::PairingChanged {
            status: PairingStatus::RequestedByPeer,
        }
    })
    .await;
    assert!(!device.is_paired());
}

#[tokio::test]
async fn test_reasserted_request_resets_timeout() {
    let (registry, _recording) = recorder_registry();
    let local = local_with(registry);
    let peer = recorder_peer();
    let device = Device::new(
        peer.clone(),
        local.context.clone(),
        DeviceOptions {
            pairing_timeout: Duration::from_millis(600),
        },
    );
    let mut events = device.subscribe();
    let pair = channel_pair(&local.context.identity, &peer, false);
    device.attach_channel(pair.local.clone()).await.unwrap();

    pair.peer.send_packet(&PairingPacket::request()).await.unwrap();
    expect_event(&mut events, |e| {
        *e == DeviceEvent::PairingChanged {
            status: PairingStatus::RequestedByPeer,
        }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    pair.peer.send_packet(&PairingPacket::request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    // The first timer would have fired by now
    assert_eq!(device.pairing_status().await, PairingStatus::RequestedByPeer);

    expect_event(&mut events, |e| *e == DeviceEvent::PairingTimedOut).await;
    assert_eq!(device.pairing_status().await, PairingStatus::Unpaired);
}

#[tokio::test]
async fn test_trusted_channel_pairs_and_enables_actions() {
    let (registry, recording) = recorder_registry();
    let local = local_with(registry);
    let peer = recorder_peer();
    let device = Device::new(peer.clone(), local.context.clone(), DeviceOptions::default());
    let mut events = device.subscribe();
    let pair = channel_pair(&local.context.identity, &peer, true);

    device.attach_channel(pair.local.clone()).await.unwrap();
    assert!(device.is_paired());
    assert!(device.is_action_enabled("foo").await);
    assert!(device.is_action_enabled("bar").await);
    assert!(device.is_action_enabled("baz").await);
    assert!(recording.contains("connected"));
    assert!(local.trust.is_trusted(pair.local.fingerprint()).await);

    expect_event(&mut events, |e| {
        *e == DeviceEvent::ConnectionChanged { connected: true }
    })
    .await;

    // The peer hanging up disconnects the device but keeps it around
    pair.peer.close().await;
    expect_event(&mut events, |e| {
        *e == DeviceEvent::ConnectionChanged { connected: false }
    })
    .await;
    assert!(!device.is_connected());
    assert!(device.is_paired());
    eventually(|| recording.contains("disconnected")).await;
    assert!(!device.is_action_enabled("foo").await);
    assert!(!recording.contains("destroy"));
    assert!(device.has_plugin("recorder").await);
}

#[tokio::test]
async fn test_unpair_clears_trust_and_tells_peer() {
    let (registry, _recording) = recorder_registry();
    let local = local_with(registry);
    let peer = recorder_peer();
    let device = Device::new(peer.clone(), local.context.clone(), DeviceOptions::default());
    let pair = channel_pair(&local.context.identity, &peer, true);
    device.attach_channel(pair.local.clone()).await.unwrap();
    let fingerprint = pair.local.fingerprint().to_string();
    assert!(local.trust.is_trusted(&fingerprint).await);

    device.unpair().await.unwrap();
    let unpair = expect_packet(&pair.peer, "kdeconnect.pair").await;
    assert_eq!(unpair.get_body_field::<bool>("pair"), Some(false));
    assert!(!device.is_paired());
    assert!(!local.trust.is_trusted(&fingerprint).await);
    assert!(!pair.local.is_trusted());
    assert!(!device.is_action_enabled("baz").await);

    assert!(matches!(
        device.send_packet(Packet::new(PACKET_TYPE_FOO, json!({}))).await,
        Err(ProtocolError::NotPaired)
    ));
}

#[tokio::test]
async fn test_peer_unpair_drops_pairing() {
    let (registry, recording) = recorder_registry();
    let local = local_with(registry);
    let peer = recorder_peer();
    let device = Device::new(peer.clone(), local.context.clone(), DeviceOptions::default());
    let mut events = device.subscribe();
    let pair = channel_pair(&local.context.identity, &peer, true);
    device.attach_channel(pair.local.clone()).await.unwrap();

    pair.peer.send_packet(&PairingPacket::unpair()).await.unwrap();
    expect_event(&mut events, |e| {
        *e == DeviceEvent::PairingChanged {
            status: PairingStatus::Unpaired,
        }
    })
    .await;
    assert!(!local.trust.is_trusted(pair.local.fingerprint()).await);
    eventually(|| recording.contains("disconnected")).await;
}

#[tokio::test]
async fn test_capability_update_renegotiates() {
    let (registry, recording) = recorder_registry();
    let local = local_with(registry);
    let peer = recorder_peer();
    let device = Device::new(peer.clone(), local.context.clone(), DeviceOptions::default());
    let mut events = device.subscribe();
    let pair = channel_pair(&local.context.identity, &peer, true);
    device.attach_channel(pair.local.clone()).await.unwrap();
    assert!(device.is_action_enabled("foo").await);

    // Peer stops receiving kdeconnect.foo
    pair.peer
        .send_packet(&Packet::new(
            "kdeconnect.capabilities",
            json!({
                "incomingCapabilities": [PACKET_TYPE_BAR],
                "outgoingCapabilities": [PACKET_TYPE_FOO, PACKET_TYPE_BAR],
            }),
        ))
        .await
        .unwrap();
    expect_event(&mut events, |e| {
        *e == DeviceEvent::ActionChanged {
            action: "foo".to_string(),
            enabled: false,
        }
    })
    .await;
    assert!(device.is_action_enabled("bar").await);

    // Nothing in common any more: the plugin goes away
    pair.peer
        .send_packet(&Packet::new(
            "kdeconnect.capabilities",
            json!({ "incomingCapabilities": [], "outgoingCapabilities": [] }),
        ))
        .await
        .unwrap();
    expect_event(&mut events, |e| {
        *e == DeviceEvent::PluginRemoved("recorder".to_string())
    })
    .await;
    assert!(!device.has_plugin("recorder").await);
    assert!(device.actions().await.is_empty());
    eventually(|| recording.contains("destroy")).await;
}

#[tokio::test]
async fn test_channel_for_other_device_is_rejected() {
    let local = local_with(PluginRegistry::new());
    let device = Device::new(recorder_peer(), local.context.clone(), DeviceOptions::default());
    let stranger = identity("someone_else", "Stranger", lanconnect_protocol::DeviceType::Phone);
    let pair = channel_pair(&local.context.identity, &stranger, true);

    assert!(matches!(
        device.attach_channel(pair.local.clone()).await,
        Err(ProtocolError::InvalidState(_))
    ));
    assert!(!device.is_connected());
}

#[tokio::test]
async fn test_new_channel_replaces_old() {
    let (registry, _recording) = recorder_registry();
    let local = local_with(registry);
    let peer = recorder_peer();
    let device = Device::new(peer.clone(), local.context.clone(), DeviceOptions::default());

    let first = channel_pair(&local.context.identity, &peer, true);
    device.attach_channel(first.local.clone()).await.unwrap();
    let second = channel_pair(&local.context.identity, &peer, true);
    device.attach_channel(second.local.clone()).await.unwrap();

    assert!(first.local.is_closed());
    assert!(device.is_connected());

    // The old read loop ending does not disconnect the new channel
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(device.is_connected());
    device.send_packet(Packet::new(PACKET_TYPE_FOO, json!({}))).await.unwrap();
    expect_packet(&second.peer, PACKET_TYPE_FOO).await;
}

// ---- plugin that holds its lock until released ----

const PACKET_TYPE_SLOW: &str = "kdeconnect.slow";

static GATED_METADATA: PluginMetadata = PluginMetadata {
    id: "gated",
    label: "Gated",
    description: "Blocks in its action until released",
    incoming: &[PACKET_TYPE_SLOW],
    outgoing: &[PACKET_TYPE_SLOW],
    actions: &[ActionSpec {
        name: "hold",
        label: "Hold",
        parameter: ParameterShape::None,
        incoming: &[],
        outgoing: &[PACKET_TYPE_SLOW],
    }],
};

struct GatedPlugin {
    release: Arc<Semaphore>,
    recording: Recording,
}

#[async_trait]
impl Plugin for GatedPlugin {
    fn metadata(&self) -> &'static PluginMetadata {
        &GATED_METADATA
    }

    async fn handle_packet(&mut self, ctx: &PluginContext, packet: &Packet) -> Result<()> {
        self.recording.push(format!(
            "packet:{} paired={}",
            packet.packet_type,
            ctx.is_paired()
        ));
        Ok(())
    }

    async fn activate(
        &mut self,
        _ctx: &PluginContext,
        action: &str,
        _param: ActionParameter,
    ) -> Result<()> {
        self.recording.push(format!("activate:{}", action));
        let _permit = self.release.acquire().await;
        Ok(())
    }
}

struct GatedFactory {
    release: Arc<Semaphore>,
    recording: Recording,
}

impl PluginFactory for GatedFactory {
    fn metadata(&self) -> &'static PluginMetadata {
        &GATED_METADATA
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(GatedPlugin {
            release: self.release.clone(),
            recording: self.recording.clone(),
        })
    }
}

#[tokio::test]
async fn test_unpair_while_plugin_busy_blocks_queued_work() {
    let release = Arc::new(Semaphore::new(0));
    let recording = Recording::default();
    let mut registry = PluginRegistry::new();
    registry
        .register_factory(Arc::new(GatedFactory {
            release: release.clone(),
            recording: recording.clone(),
        }))
        .unwrap();
    let local = local_with(registry);
    let peer = peer_with(&[PACKET_TYPE_SLOW]);
    let device = Device::new(peer.clone(), local.context.clone(), DeviceOptions::default());
    let pair = channel_pair(&local.context.identity, &peer, true);
    device.attach_channel(pair.local.clone()).await.unwrap();
    assert!(device.is_action_enabled("hold").await);

    // The first activation holds the plugin lock
    let first = tokio::spawn({
        let device = device.clone();
        async move { device.activate_action("hold", None).await }
    });
    eventually(|| recording.count("activate:") == 1).await;

    // A packet and a second activation queue up behind it
    pair.peer
        .send_packet(&Packet::new(PACKET_TYPE_SLOW, json!({})))
        .await
        .unwrap();
    let second = tokio::spawn({
        let device = device.clone();
        async move { device.activate_action("hold", None).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let unpair = tokio::spawn({
        let device = device.clone();
        async move { device.unpair().await }
    });
    eventually(|| !device.is_paired()).await;

    release.add_permits(8);
    first.await.unwrap().unwrap();
    assert!(matches!(
        second.await.unwrap(),
        Err(ProtocolError::UnsupportedAction(_))
    ));
    unpair.await.unwrap().unwrap();

    let unpaired = expect_packet(&pair.peer, "kdeconnect.pair").await;
    assert_eq!(unpaired.get_body_field::<bool>("pair"), Some(false));
    assert_eq!(recording.count("activate:"), 1);
    assert_eq!(recording.count("packet:"), 0);
}
