use std::time::Duration;

use anyhow::Result;

use pn_discovery::PeerEvent;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Discovery and departure between contexts
// ══════════════════════════════════════════════════════════════════════════════

/// A announces, B listens: exactly one discovery carrying what A announced,
/// and A is then findable by type. Later refreshes are silent.
#[tokio::test]
async fn test_peer_discovered_once() -> Result<()> {
    let (mut a, mut b) = pair()?;
    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    a.start_announcing("A1", "sdr_server", 4535, 4536, Some("caps1"))
        .await?;

    let event = events.next().await;
    let PeerEvent::Discovered(peer) = event else {
        panic!("expected discovery, got {event:?}");
    };
    assert_eq!(peer.id, "A1");
    assert_eq!(peer.service, "sdr_server");
    assert_eq!(peer.ip, a.local_ip().to_string());
    assert_eq!(peer.ctrl_port, 4535);
    assert_eq!(peer.data_port, 4536);
    assert_eq!(peer.caps, "caps1");

    let found = b.find_peer_by_type("sdr_server").expect("A1 should be known");
    assert_eq!(found.id, "A1");

    // A announces every second; none of the refreshes is an event.
    events.assert_quiet(Duration::from_millis(2500)).await;
    assert_eq!(b.peer_count(), 1);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// Stopping the announcer sends a departure; B forgets A.
#[tokio::test]
async fn test_stop_announcing_reports_departure() -> Result<()> {
    let (mut a, mut b) = pair()?;
    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    a.start_announcing("A1", "sdr_server", 4535, 4536, Some("caps1"))
        .await?;
    assert!(matches!(events.next().await, PeerEvent::Discovered(_)));

    a.stop_announcing().await;
    let event = events.next().await;
    let PeerEvent::Departed(peer) = event else {
        panic!("expected departure, got {event:?}");
    };
    assert_eq!(peer.id, "A1");
    assert_eq!(peer.service, "sdr_server");
    assert!(b.find_peer_by_id("A1").is_none());
    assert_eq!(b.peer_count(), 0);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// Announcing under a new identity retires the old one first.
#[tokio::test]
async fn test_reannounce_departs_old_identity() -> Result<()> {
    let (mut a, mut b) = pair()?;
    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    a.start_announcing("A1", "waterfall", 0, 0, None).await?;
    assert_eq!(events.next().await.peer().id, "A1");

    a.start_announcing("A2", "waterfall", 0, 0, None).await?;

    let departed = events.next().await;
    assert!(matches!(departed, PeerEvent::Departed(_)));
    assert_eq!(departed.peer().id, "A1");

    let discovered = events.next().await;
    assert!(matches!(discovered, PeerEvent::Discovered(_)));
    assert_eq!(discovered.peer().id, "A2");

    assert_eq!(b.peer_count(), 1);
    assert!(b.find_peer_by_id("A1").is_none());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// Shutdown of an announcing context is seen as a departure.
#[tokio::test]
async fn test_shutdown_sends_departure() -> Result<()> {
    let (mut a, mut b) = pair()?;
    let (callback, mut events) = recorder();
    b.start_listening(callback)?;

    a.start_announcing("A1", "controller", 7000, 0, None).await?;
    events.next().await;

    a.shutdown().await;
    assert!(events.next().await.is_departure());

    b.shutdown().await;
    Ok(())
}

/// Both sides announce and listen. Each learns about the other and never
/// about itself, even though A also sends to its own port.
#[tokio::test]
async fn test_mutual_discovery_without_self() -> Result<()> {
    let ports = free_ports(2);
    let mut a = context(ports[0], &[ports[1], ports[0]])?;
    let mut b = context(ports[1], &[ports[0]])?;

    let (cb_a, mut events_a) = recorder();
    let (cb_b, mut events_b) = recorder();
    a.start_listening(cb_a)?;
    b.start_listening(cb_b)?;

    a.start_announcing("A1", "sdr_server", 4535, 4536, None).await?;
    b.start_announcing("B1", "waterfall", 0, 0, None).await?;

    assert_eq!(events_a.next().await.peer().id, "B1");
    assert_eq!(events_b.next().await.peer().id, "A1");

    events_a.assert_quiet(Duration::from_millis(1500)).await;
    assert_eq!(a.peer_count(), 1);
    assert!(a.find_peer_by_id("A1").is_none());

    let peers = b.snapshot_peers(10);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, "A1");

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// A context that hears its own traffic never reports itself. This holds when
/// a session stops, and when it is replaced, while the last presence and
/// departure are still queued. B, which hears the same datagrams, shows they
/// were really sent.
#[tokio::test]
async fn test_own_sessions_never_reported() -> Result<()> {
    let ports = free_ports(2);
    let mut a = context(ports[0], &[ports[0], ports[1]])?;
    let mut b = context(ports[1], &[])?;

    let (cb_a, mut events_a) = recorder();
    let (cb_b, mut events_b) = recorder();
    a.start_listening(cb_a)?;
    b.start_listening(cb_b)?;

    for _ in 0..5 {
        a.start_announcing("ME", "sdr_server", 4535, 4536, None).await?;
        a.stop_announcing().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(matches!(events_b.next().await, PeerEvent::Discovered(_)));
        assert!(matches!(events_b.next().await, PeerEvent::Departed(_)));
    }

    a.start_announcing("OLD", "waterfall", 0, 0, None).await?;
    a.start_announcing("NEW", "waterfall", 0, 0, None).await?;
    assert_eq!(events_b.next().await.peer().id, "OLD");
    assert_eq!(events_b.next().await.peer().id, "OLD");
    assert_eq!(events_b.next().await.peer().id, "NEW");

    events_a.assert_quiet(Duration::from_millis(1500)).await;
    assert_eq!(a.peer_count(), 0);
    assert!(a.find_peer_by_id("ME").is_none());
    assert!(a.find_peer_by_id("OLD").is_none());
    assert!(a.find_peer_by_id("NEW").is_none());

    a.shutdown().await;
    assert!(events_b.next().await.is_departure());
    events_a.assert_quiet(Duration::from_millis(300)).await;
    assert_eq!(a.peer_count(), 0);

    b.shutdown().await;
    Ok(())
}
