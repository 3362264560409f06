use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;

use pn_discovery::{Discovery, DiscoveryError, PeerEvent};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Bad input, full registries and lifecycle misuse
// ══════════════════════════════════════════════════════════════════════════════

/// Garbage, foreign protocols and incomplete messages change nothing.
/// The listener keeps working afterwards.
#[tokio::test]
async fn test_malformed_traffic_is_ignored() -> Result<()> {
    let port = free_ports(1)[0];
    let mut b = context(port, &[])?;
    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    let raw = RawPeer::new().await?;
    let junk: [&[u8]; 6] = [
        b"hello",
        &[0xff; 2048],
        br#"[1,2,3]"#,
        br#"{"m":"MDNS","v":1,"cmd":"helo","id":"X","svc":"s"}"#,
        br#"{"m":"PNSD","v":1,"cmd":"helo","id":"X"}"#,
        br#"{"m":"PNSD","v":1,"cmd":"ping","id":"X","svc":"s"}"#,
    ];
    for datagram in junk {
        raw.send(port, datagram).await?;
    }
    events.assert_quiet(Duration::from_millis(500)).await;
    assert_eq!(b.peer_count(), 0);

    raw.presence(port, "real", "waterfall").await?;
    assert_eq!(events.next().await.peer().id, "real");

    b.shutdown().await;
    Ok(())
}

/// A departure for a peer nobody has seen produces nothing.
#[tokio::test]
async fn test_unknown_departure_is_silent() -> Result<()> {
    let port = free_ports(1)[0];
    let mut b = context(port, &[])?;
    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    let raw = RawPeer::new().await?;
    raw.presence(port, "known", "detector").await?;
    events.next().await;

    raw.departure(port, "stranger").await?;
    events.assert_quiet(Duration::from_millis(500)).await;
    assert_eq!(b.peer_count(), 1);

    b.shutdown().await;
    Ok(())
}

/// New identities beyond capacity are dropped; known ones still refresh
/// and still depart.
#[tokio::test]
async fn test_full_registry_drops_new_peers() -> Result<()> {
    let port = free_ports(1)[0];
    let mut config = loopback_config(port, &[]);
    config.registry.capacity = 2;
    let mut b = Discovery::init(config)?;
    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    let raw = RawPeer::new().await?;
    raw.presence(port, "P1", "s").await?;
    raw.presence(port, "P2", "s").await?;
    events.next().await;
    events.next().await;

    raw.presence(port, "P3", "s").await?;
    raw.presence(port, "P1", "s").await?;
    events.assert_quiet(Duration::from_millis(500)).await;
    assert_eq!(b.peer_count(), 2);
    assert!(b.find_peer_by_id("P3").is_none());

    raw.departure(port, "P1").await?;
    assert!(matches!(events.next().await, PeerEvent::Departed(_)));

    // The freed slot now takes the newcomer.
    raw.presence(port, "P3", "s").await?;
    assert_eq!(events.next().await.peer().id, "P3");

    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_bind_to_foreign_address_fails() {
    let mut config = loopback_config(free_ports(1)[0], &[]);
    // TEST-NET-1 is never a local address.
    config.network.bind_addr = Ipv4Addr::new(192, 0, 2, 1);
    let result = Discovery::init(config);
    assert!(matches!(result, Err(DiscoveryError::Bind { .. })));
}

#[tokio::test]
async fn test_start_after_shutdown_fails() -> Result<()> {
    let port = free_ports(1)[0];
    let mut a = context(port, &[])?;
    a.shutdown().await;

    assert!(matches!(
        a.start_announcing("A1", "sdr_server", 1, 0, None).await,
        Err(DiscoveryError::ShutDown)
    ));
    assert!(matches!(
        a.start_listening(|_| {}),
        Err(DiscoveryError::ShutDown)
    ));

    // The port is free again.
    let again = context(port, &[])?;
    assert_eq!(again.local_addr().port(), port);
    Ok(())
}
