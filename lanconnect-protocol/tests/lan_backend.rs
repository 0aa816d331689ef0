//! Two LAN channel services talking over loopback

mod common;

use common::WAIT;
use lanconnect_protocol::store::{MemoryTrustStore, TrustStore};
use lanconnect_protocol::{
    CertificateInfo, Channel, ChannelService, DeviceInfo, DeviceType, LanChannelService, Packet,
    ServiceConfig, ServiceEvent, Transfer, TransferConfig,
};
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Node {
    service: LanChannelService,
    certificate: Arc<CertificateInfo>,
    trust: Arc<MemoryTrustStore>,
}

fn node(id: &str, port: u16) -> Node {
    let identity = DeviceInfo::with_id(id, id, DeviceType::Desktop, 0)
        .with_incoming_capability("kdeconnect.ping")
        .with_outgoing_capability("kdeconnect.ping");
    let certificate = Arc::new(CertificateInfo::generate(id).unwrap());
    let trust = Arc::new(MemoryTrustStore::new());
    let service = LanChannelService::new(
        identity,
        certificate.clone(),
        trust.clone(),
        ServiceConfig {
            bind_addr: std::net::SocketAddr::from(([127, 0, 0, 1], port)),
            broadcast_interval: None,
            ..Default::default()
        },
    );
    Node {
        service,
        certificate,
        trust,
    }
}

async fn opened(events: &mut broadcast::Receiver<ServiceEvent>) -> Arc<Channel> {
    tokio::time::timeout(WAIT, async {
        loop {
            if let ServiceEvent::ChannelOpened(channel) = events.recv().await.unwrap() {
                return channel;
            }
        }
    })
    .await
    .expect("no channel opened")
}

/// Start both nodes and connect them through a unicast identity
async fn connected(a: &Node, b: &Node) -> (Arc<Channel>, Arc<Channel>) {
    let mut a_events = a.service.subscribe();
    let mut b_events = b.service.subscribe();
    a.service.start().await.unwrap();
    b.service.start().await.unwrap();

    a.service
        .broadcast(b.service.local_addr())
        .await
        .unwrap();

    let a_channel = opened(&mut a_events).await;
    let b_channel = opened(&mut b_events).await;
    (a_channel, b_channel)
}

#[tokio::test]
async fn test_discovery_opens_one_channel_each() {
    let a = node("device_a", 1717);
    let b = node("device_b", 1718);
    let mut a_events = a.service.subscribe();
    let mut b_events = b.service.subscribe();
    a.service.start().await.unwrap();
    b.service.start().await.unwrap();
    let a_addr = a.service.local_addr();
    let b_addr = b.service.local_addr();
    assert_eq!(a_addr.unwrap().port(), 1717);

    // Both sides announce themselves at once before any channel exists
    let (to_b, to_a) = tokio::join!(a.service.broadcast(b_addr), b.service.broadcast(a_addr));
    to_b.unwrap();
    to_a.unwrap();

    let a_channel = opened(&mut a_events).await;
    let b_channel = opened(&mut b_events).await;
    assert_eq!(a_channel.device_id(), "device_b");
    assert_eq!(b_channel.device_id(), "device_a");

    // Fingerprints bind each side to the other's certificate
    assert_eq!(a_channel.fingerprint(), b.certificate.fingerprint);
    assert_eq!(b_channel.fingerprint(), a.certificate.fingerprint);
    assert!(!a_channel.is_trusted());

    // Identities inside TLS carry the capabilities
    assert_eq!(
        a_channel.identity().incoming_capabilities,
        vec!["kdeconnect.ping".to_string()]
    );
    assert_eq!(a_channel.identity().tcp_port, b_addr.unwrap().port());

    // Repeated symmetric announcements do not open a second channel
    for _ in 0..3 {
        let (to_b, to_a) = tokio::join!(a.service.broadcast(b_addr), b.service.broadcast(a_addr));
        to_b.unwrap();
        to_a.unwrap();
    }
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(a.service.channel_count().await, 1);
    assert_eq!(b.service.channel_count().await, 1);
    assert!(!a_channel.is_closed());
    assert!(!b_channel.is_closed());

    a.service.stop().await;
    b.service.stop().await;
}

#[tokio::test]
async fn test_known_fingerprint_is_trusted() {
    let a = node("device_a", 0);
    let b = node("device_b", 0);
    a.trust
        .set_trusted(&b.certificate.fingerprint, true)
        .await
        .unwrap();

    let (a_channel, b_channel) = connected(&a, &b).await;
    assert!(a_channel.is_trusted());
    assert!(!b_channel.is_trusted());

    a.service.stop().await;
    b.service.stop().await;
}

#[tokio::test]
async fn test_packets_flow_both_ways() {
    let a = node("device_a", 0);
    let b = node("device_b", 0);
    let (a_channel, b_channel) = connected(&a, &b).await;

    a_channel
        .send_packet(&Packet::new("kdeconnect.ping", json!({ "message": "hi" })))
        .await
        .unwrap();
    let received = common::expect_packet(&b_channel, "kdeconnect.ping").await;
    assert_eq!(received.get_body_field::<String>("message").as_deref(), Some("hi"));

    b_channel
        .send_packet(&Packet::new("kdeconnect.ping", json!({})))
        .await
        .unwrap();
    let received = common::expect_packet(&a_channel, "kdeconnect.ping").await;
    assert!(received.get_body_field::<String>("message").is_none());

    a.service.stop().await;
    b.service.stop().await;
}

#[tokio::test]
async fn test_payload_transfer_over_lan_channel() {
    let a = node("device_a", 0);
    let b = node("device_b", 0);
    let (a_channel, b_channel) = connected(&a, &b).await;

    let data: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 251) as u8).collect();
    let upload = Transfer::upload(
        a_channel.clone(),
        Packet::new("kdeconnect.share.request", json!({ "filename": "data.bin" })),
        Cursor::new(data.clone()),
        Some(data.len() as u64),
        &TransferConfig::ephemeral(),
    )
    .await
    .unwrap();
    let uploading = tokio::spawn(upload.start());

    let announced = common::expect_packet(&b_channel, "kdeconnect.share.request").await;
    assert_eq!(announced.payload_size, Some(data.len() as i64));

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("data.bin");
    let sink = tokio::fs::File::create(&target).await.unwrap();
    let received = Transfer::download(b_channel.clone(), announced, sink)
        .unwrap()
        .start()
        .await
        .unwrap();

    assert_eq!(received, data.len() as u64);
    assert_eq!(uploading.await.unwrap().unwrap(), data.len() as u64);
    assert_eq!(std::fs::read(&target).unwrap(), data);

    a.service.stop().await;
    b.service.stop().await;
}

#[tokio::test]
async fn test_stop_closes_channels() {
    let a = node("device_a", 0);
    let b = node("device_b", 0);
    let (a_channel, b_channel) = connected(&a, &b).await;
    let mut a_events = a.service.subscribe();
    let mut b_events = b.service.subscribe();

    // EOF is only noticed by a reader
    let reader = b_channel.clone();
    tokio::spawn(async move { while reader.read_packet().await.is_ok() {} });

    a.service.stop().await;
    assert!(!a.service.is_active());
    assert_eq!(a.service.channel_count().await, 0);
    assert!(a_channel.is_closed());

    let mut closed = false;
    let mut stopped = false;
    while let Ok(event) = a_events.try_recv() {
        match event {
            ServiceEvent::ChannelClosed { device_id } => {
                assert_eq!(device_id, "device_b");
                closed = true;
            }
            ServiceEvent::Stopped => stopped = true,
            _ => {}
        }
    }
    assert!(closed && stopped);

    // The other side sees the connection drop
    tokio::time::timeout(WAIT, b_channel.closed()).await.unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            if let ServiceEvent::ChannelClosed { device_id } = b_events.recv().await.unwrap() {
                return device_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(b.service.channel_count().await, 0);

    b.service.stop().await;
}
