//! End-to-end scenarios spanning the channel, pairing, and plugin-dispatch
//! layers together, the way two real devices on a LAN would actually drive
//! them. Unlike the unit tests colocated with each module, these wire
//! together independently-constructed `IdentityStore`s, `Channel`s, and
//! `DeviceManager`s with nothing stubbed out.

use cosmic_ext_connect_core::crypto::{common_name_of, IdentityStore};
use cosmic_ext_connect_core::device::manager::DeviceManager;
use cosmic_ext_connect_core::network::channel::Channel;
use cosmic_ext_connect_core::network::ChannelEvent;
use cosmic_ext_connect_core::plugins::{PingPlugin, PluginHost};
use cosmic_ext_connect_core::protocol::{DeviceType, Identity};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Establish a TLS channel over loopback TCP in both directions and
/// exchange identity packets over the encrypted channel, mirroring
/// `ChannelService::connect`/`handle_accepted`.
async fn handshake(
    server_identity: &IdentityStore,
    server_device: Identity,
    client_identity: &IdentityStore,
    client_device: Identity,
) -> (Channel, Channel) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        tcp
    });
    let client_tcp = TcpStream::connect(addr).await.unwrap();
    let server_tcp = accept.await.unwrap();

    let mut server_channel = Channel::from_accepted(server_tcp, server_identity).await.unwrap();
    let mut client_channel = Channel::from_connected(client_tcp, IpAddr::V4(Ipv4Addr::LOCALHOST), client_identity)
        .await
        .unwrap();

    client_channel.write_packet(&client_device.to_packet()).await.unwrap();
    let received_on_server = server_channel.read_packet().await.unwrap();
    assert_eq!(
        Identity::from_packet(&received_on_server).unwrap().device_id,
        client_device.device_id
    );

    server_channel.write_packet(&server_device.to_packet()).await.unwrap();
    let received_on_client = client_channel.read_packet().await.unwrap();
    assert_eq!(
        Identity::from_packet(&received_on_client).unwrap().device_id,
        server_device.device_id
    );

    (server_channel, client_channel)
}

fn empty_host() -> Arc<PluginHost> {
    Arc::new(PluginHost::new(vec![Arc::new(PingPlugin::default())]))
}

fn ping_caps() -> BTreeSet<String> {
    ["kdeconnect.ping".to_string()].into_iter().collect()
}

#[tokio::test]
async fn certificate_common_name_matches_identity_device_id_on_both_sides() {
    let alice = IdentityStore::generate("alice-device").unwrap();
    let bob = IdentityStore::generate("bob-device").unwrap();

    let alice_identity = Identity::new("alice-device", "Alice", DeviceType::Laptop, 1716);
    let bob_identity = Identity::new("bob-device", "Bob", DeviceType::Phone, 1716);

    let (server_channel, client_channel) =
        handshake(&bob, bob_identity.clone(), &alice, alice_identity.clone()).await;

    assert_eq!(
        common_name_of(server_channel.peer_cert_der()).unwrap(),
        alice_identity.device_id
    );
    assert_eq!(
        common_name_of(client_channel.peer_cert_der()).unwrap(),
        bob_identity.device_id
    );
}

#[tokio::test]
async fn pairing_then_ping_round_trips_between_two_device_managers() {
    let alice = IdentityStore::generate("alice-device").unwrap();
    let bob = IdentityStore::generate("bob-device").unwrap();

    let alice_identity = Identity::new("alice-device", "Alice", DeviceType::Laptop, 1716)
        .with_incoming_capabilities(["kdeconnect.ping".to_string()])
        .with_outgoing_capabilities(["kdeconnect.ping".to_string()]);
    let bob_identity = Identity::new("bob-device", "Bob", DeviceType::Phone, 1716)
        .with_incoming_capabilities(["kdeconnect.ping".to_string()])
        .with_outgoing_capabilities(["kdeconnect.ping".to_string()]);

    let (bob_side_channel, alice_side_channel) =
        handshake(&bob, bob_identity.clone(), &alice, alice_identity.clone()).await;

    // Each manager sees the *other* device connecting to it.
    let alice_dir = tempfile::tempdir().unwrap();
    let (alice_events_tx, alice_events_rx) = mpsc::channel(8);
    let alice_manager = DeviceManager::spawn(
        alice_dir.path().to_path_buf(),
        Arc::new(cosmic_ext_connect_core::crypto::TrustStore::new()),
        empty_host(),
        ping_caps(),
        ping_caps(),
        alice_events_rx,
        CancellationToken::new(),
        Vec::new(),
    )
    .await
    .unwrap();

    let bob_dir = tempfile::tempdir().unwrap();
    let (bob_events_tx, bob_events_rx) = mpsc::channel(8);
    let bob_manager = DeviceManager::spawn(
        bob_dir.path().to_path_buf(),
        Arc::new(cosmic_ext_connect_core::crypto::TrustStore::new()),
        empty_host(),
        ping_caps(),
        ping_caps(),
        bob_events_rx,
        CancellationToken::new(),
        Vec::new(),
    )
    .await
    .unwrap();

    alice_events_tx
        .send(ChannelEvent::Connected {
            device_id: bob_identity.device_id.clone(),
            identity: bob_identity.clone(),
            channel: alice_side_channel,
        })
        .await
        .unwrap();
    bob_events_tx
        .send(ChannelEvent::Connected {
            device_id: alice_identity.device_id.clone(),
            identity: alice_identity.clone(),
            channel: bob_side_channel,
        })
        .await
        .unwrap();

    // Let both connection tasks spin up before driving pairing.
    let mut alice_summaries = alice_manager.subscribe();
    alice_summaries.changed().await.unwrap();
    let mut bob_summaries = bob_manager.subscribe();
    bob_summaries.changed().await.unwrap();

    alice_manager.request_pairing(&bob_identity.device_id).await.unwrap();
    // Give bob's connection task a beat to read the pair request.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    bob_manager.accept_pairing(&alice_identity.device_id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert!(alice_manager
        .subscribe()
        .borrow()
        .iter()
        .find(|s| s.id == bob_identity.device_id)
        .map(|s| s.paired)
        .unwrap_or(false));
    assert!(bob_manager
        .subscribe()
        .borrow()
        .iter()
        .find(|s| s.id == alice_identity.device_id)
        .map(|s| s.paired)
        .unwrap_or(false));

    alice_manager
        .send(
            &bob_identity.device_id,
            cosmic_ext_connect_core::protocol::Packet::new("kdeconnect.ping", serde_json::json!({})),
            false,
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
}

#[tokio::test]
async fn disconnect_of_an_unpaired_device_drops_it_from_the_summary_list() {
    let alice = IdentityStore::generate("alice-device-2").unwrap();
    let bob = IdentityStore::generate("bob-device-2").unwrap();

    let alice_identity = Identity::new("alice-device-2", "Alice", DeviceType::Laptop, 1716);
    let bob_identity = Identity::new("bob-device-2", "Bob", DeviceType::Phone, 1716);

    let (bob_side_channel, _alice_side_channel) =
        handshake(&bob, bob_identity.clone(), &alice, alice_identity.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let (events_tx, events_rx) = mpsc::channel(8);
    let manager = DeviceManager::spawn(
        dir.path().to_path_buf(),
        Arc::new(cosmic_ext_connect_core::crypto::TrustStore::new()),
        empty_host(),
        ping_caps(),
        ping_caps(),
        events_rx,
        CancellationToken::new(),
        Vec::new(),
    )
    .await
    .unwrap();

    events_tx
        .send(ChannelEvent::Connected {
            device_id: alice_identity.device_id.clone(),
            identity: alice_identity.clone(),
            channel: bob_side_channel,
        })
        .await
        .unwrap();

    let mut summaries = manager.subscribe();
    summaries.changed().await.unwrap();
    assert_eq!(summaries.borrow().len(), 1);

    events_tx
        .send(ChannelEvent::Disconnected {
            device_id: alice_identity.device_id.clone(),
        })
        .await
        .unwrap();
    summaries.changed().await.unwrap();
    assert_eq!(summaries.borrow().len(), 0);
}
