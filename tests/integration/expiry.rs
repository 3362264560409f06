use std::time::Duration;

use anyhow::Result;

use pn_discovery::{Discovery, PeerEvent};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Staleness expiry
// ══════════════════════════════════════════════════════════════════════════════

/// A peer that goes silent without a departure is reported as expired once
/// the TTL passes.
#[tokio::test]
async fn test_silent_peer_expires() -> Result<()> {
    let port = free_ports(1)[0];
    let mut config = loopback_config(port, &[]);
    config.registry.peer_ttl_secs = 1;
    let mut b = Discovery::init(config)?;

    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    let raw = RawPeer::new().await?;
    raw.presence(port, "ghost", "detector").await?;
    assert!(matches!(events.next().await, PeerEvent::Discovered(_)));

    let event = events.next().await;
    let PeerEvent::Expired(peer) = event else {
        panic!("expected expiry, got {event:?}");
    };
    assert_eq!(peer.id, "ghost");
    assert!(peer.last_seen.elapsed() >= Duration::from_secs(1));
    assert_eq!(b.peer_count(), 0);

    b.shutdown().await;
    Ok(())
}

/// A peer that keeps announcing never expires.
#[tokio::test]
async fn test_announcing_peer_is_kept_alive() -> Result<()> {
    let ports = free_ports(2);
    let mut a = context(ports[0], &[ports[1]])?;
    let mut config = loopback_config(ports[1], &[]);
    config.registry.peer_ttl_secs = 3;
    let mut b = Discovery::init(config)?;

    let (callback, mut events) = recorder();
    b.start_listening(callback)?;
    a.start_announcing("A1", "sdr_server", 4535, 0, None).await?;

    events.next().await;
    events.assert_quiet(Duration::from_secs(4)).await;
    assert_eq!(b.peer_count(), 1);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// Without a TTL, silent peers stay until they depart.
#[tokio::test]
async fn test_no_expiry_by_default() -> Result<()> {
    let port = free_ports(1)[0];
    let mut b = context(port, &[])?;
    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    let raw = RawPeer::new().await?;
    raw.presence(port, "quiet", "detector").await?;
    events.next().await;

    events.assert_quiet(Duration::from_secs(2)).await;
    assert!(b.find_peer_by_id("quiet").is_some());

    b.shutdown().await;
    Ok(())
}
