//! Integration tests for the sacn-source crate public API.
//!
//! Socket-dependent behavior (multicast egress) is environment
//! specific, so these tests stick to the engine's command surface:
//! validation, universe lifecycle, and the stop/terminate handshake.

use sacn_source::{IpMode, Priority, Source, SourceConfig, SourceError, UniverseData};

fn config() -> SourceConfig {
    SourceConfig::default()
}

// ---------------------------------------------------------------------------
// 1. Constructor validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ipv6_without_interfaces_rejected() {
    let config = SourceConfig {
        ip_mode: IpMode::Ipv4And6,
        interfaces: Vec::new(),
        ..SourceConfig::default()
    };
    assert!(matches!(
        Source::new(config),
        Err(SourceError::Ipv6RequiresInterfaces)
    ));
}

// ---------------------------------------------------------------------------
// 2. Universe lifecycle without transmission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn universe_bookkeeping() {
    let (source, _events) = Source::new(config()).unwrap();

    source.add_universe(UniverseData::new(1)).await.unwrap();
    source
        .add_universe(UniverseData {
            universe: 63999,
            priority: Some(Priority::new(150).unwrap()),
            levels: vec![255; 600], // truncated at 512
            priorities: Some(vec![100; 512]),
        })
        .await
        .unwrap();

    assert_eq!(source.universes().await.unwrap(), vec![1, 63999]);

    assert!(matches!(
        source.add_universe(UniverseData::new(1)).await,
        Err(SourceError::UniverseExists(1))
    ));
    assert!(matches!(
        source.add_universe(UniverseData::new(0)).await,
        Err(SourceError::InvalidUniverse(0))
    ));
    assert!(matches!(
        source.add_universe(UniverseData::new(64000)).await,
        Err(SourceError::InvalidUniverse(64000))
    ));

    // Removing while stopped drops immediately, no burst.
    source.remove_universe(1).await.unwrap();
    assert_eq!(source.universes().await.unwrap(), vec![63999]);
    assert!(matches!(
        source.remove_universe(1).await,
        Err(SourceError::UniverseNotFound(1))
    ));
}

#[tokio::test]
async fn updates_validate_their_targets() {
    let (source, _events) = Source::new(config()).unwrap();
    source.add_universe(UniverseData::new(5)).await.unwrap();

    source.update_levels(5, vec![1, 2, 3]).await.unwrap();
    source.update_slot(5, 511, 80).await.unwrap();
    source
        .update_priority(5, Priority::new(42).unwrap())
        .await
        .unwrap();
    source
        .update_priorities(5, Some(vec![200; 512]))
        .await
        .unwrap();
    source.update_priorities(5, None).await.unwrap();
    source.update_name("renamed desk").await.unwrap();

    assert!(matches!(
        source.update_slot(5, 512, 0).await,
        Err(SourceError::InvalidSlot { slot: 512 })
    ));
    assert!(matches!(
        source.update_levels(6, vec![0]).await,
        Err(SourceError::UniverseNotFound(6))
    ));
}

// ---------------------------------------------------------------------------
// 3. Start / stop handshake
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_stop_lifecycle() {
    let (source, mut events) = Source::new(config()).unwrap();

    assert!(matches!(source.stop().await, Err(SourceError::NotStarted)));

    source.start(true).await.unwrap();
    assert!(matches!(
        source.start(true).await,
        Err(SourceError::AlreadyStarted)
    ));

    source.stop().await.unwrap();

    // Started then ended, in order.
    let mut saw_started = false;
    let mut saw_ended = false;
    while let Ok(event) = events.try_recv() {
        match event {
            sacn_source::SourceEvent::TransmissionStarted => saw_started = true,
            sacn_source::SourceEvent::TransmissionEnded => {
                assert!(saw_started, "start precedes end");
                saw_ended = true;
            }
            _ => {}
        }
    }
    assert!(saw_started && saw_ended);
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_termination_bursts() {
    let (source, _events) = Source::new(config()).unwrap();
    source
        .add_universe(UniverseData {
            universe: 7,
            priority: None,
            levels: vec![255],
            priorities: None,
        })
        .await
        .unwrap();

    source.start(false).await.unwrap();

    // While terminating, mutations are refused.
    source.remove_universe(7).await.unwrap();
    assert!(matches!(
        source.update_levels(7, vec![0]).await,
        Err(SourceError::UniverseTerminating(7))
    ));
    assert!(matches!(
        source.remove_universe(7).await,
        Err(SourceError::UniverseTerminating(7))
    ));

    // stop resolves only after the bursts are done.
    source.stop().await.unwrap();
    assert!(source.universes().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_after_stop_keeps_universes() {
    let (source, _events) = Source::new(config()).unwrap();
    source.add_universe(UniverseData::new(3)).await.unwrap();

    source.start(false).await.unwrap();
    source.stop().await.unwrap();
    assert_eq!(source.universes().await.unwrap(), vec![3]);

    // A stopped source starts again cleanly.
    source.start(false).await.unwrap();
    source.stop().await.unwrap();
}
