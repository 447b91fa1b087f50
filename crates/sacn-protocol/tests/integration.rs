//! Integration tests for the sacn-protocol crate.
//!
//! These exercise the public API across module boundaries: packed
//! frames re-parsed through the decoder, the sequence-acceptance rule,
//! and merger behavior under realistic multi-source traffic.

use sacn_protocol::frame::{DataFrame, DiscoveryFrame};
use sacn_protocol::merge::Merger;
use sacn_protocol::packet::{Packet, StartCode};
use sacn_protocol::sequence::sequence_acceptable;
use sacn_protocol::{Priority, SourceName, Universe, UNIVERSE_SIZE};
use uuid::Uuid;

fn cid(n: u8) -> Uuid {
    Uuid::from_bytes([n; 16])
}

// ---------------------------------------------------------------------------
// 1. Data packet roundtrips -- pack with DataFrame, parse with Packet
// ---------------------------------------------------------------------------

#[test]
fn data_roundtrip_boundary_fields() {
    for (priority, universe) in [(0u8, 1u16), (100, 7), (200, 63999)] {
        let mut levels = [0u8; UNIVERSE_SIZE];
        levels[0] = 1;
        levels[UNIVERSE_SIZE - 1] = 255;
        let mut frame = DataFrame::new(
            cid(9),
            &SourceName::new("boundary check"),
            Priority::new(priority).unwrap(),
            Universe::new(universe).unwrap(),
            StartCode::Levels,
            &levels,
        );
        frame.set_sequence(255);

        let Ok(Packet::Data(packet)) = Packet::parse(frame.as_bytes()) else {
            panic!("frame with priority {priority} universe {universe} must parse");
        };
        assert_eq!(packet.priority.get(), priority);
        assert_eq!(packet.universe.get(), universe);
        assert_eq!(packet.sequence, 255);
        assert_eq!(packet.values[0], 1);
        assert_eq!(packet.values[UNIVERSE_SIZE - 1], 255);
    }
}

#[test]
fn data_roundtrip_pap_stream() {
    let frame = DataFrame::new(
        cid(2),
        &SourceName::new("pap"),
        Priority::default(),
        Universe::new(42).unwrap(),
        StartCode::PerAddressPriority,
        &[150u8; UNIVERSE_SIZE],
    );
    let Ok(Packet::Data(packet)) = Packet::parse(frame.as_bytes()) else {
        panic!("PAP frame must parse");
    };
    assert_eq!(packet.start_code, StartCode::PerAddressPriority);
    assert!(packet.values.iter().all(|&v| v == 150));
}

#[test]
fn data_roundtrip_multibyte_name_truncation() {
    // 40 two-byte chars = 80 bytes; must cut to 31 chars (62 bytes).
    let long = "ø".repeat(40);
    let name = SourceName::new(&long);
    let frame = DataFrame::new(
        cid(3),
        &name,
        Priority::default(),
        Universe::new(1).unwrap(),
        StartCode::Levels,
        &[0u8; UNIVERSE_SIZE],
    );
    let Ok(Packet::Data(packet)) = Packet::parse(frame.as_bytes()) else {
        panic!("frame must parse");
    };
    assert_eq!(packet.source_name.as_str(), "ø".repeat(31));
}

// ---------------------------------------------------------------------------
// 2. Discovery roundtrips
// ---------------------------------------------------------------------------

#[test]
fn discovery_roundtrip_two_pages() {
    let universes: Vec<Universe> = (1..=700).map(|u| Universe::new(u).unwrap()).collect();
    let name = SourceName::new("node");

    for (page, chunk) in universes.chunks(512).enumerate() {
        let frame = DiscoveryFrame::new(cid(4), &name, page as u8, 1, chunk);
        let Ok(Packet::Discovery(packet)) = Packet::parse(frame.as_bytes()) else {
            panic!("page {page} must parse");
        };
        assert_eq!(packet.page, page as u8);
        assert_eq!(packet.last_page, 1);
        assert_eq!(packet.universes.len(), chunk.len());
        assert_eq!(packet.universes.first(), chunk.first());
        assert_eq!(packet.universes.last(), chunk.last());
    }
}

#[test]
fn discovery_rejects_invalid_universe_numbers() {
    let frame = DiscoveryFrame::new(cid(4), &SourceName::new("node"), 0, 0, &[
        Universe::new(9).unwrap(),
    ]);
    let mut bytes = frame.as_bytes().to_vec();
    // Overwrite the single list entry with 64000 (out of range).
    let offset = bytes.len() - 2;
    bytes[offset..].copy_from_slice(&64000u16.to_be_bytes());
    assert!(matches!(
        Packet::parse(&bytes),
        Err(sacn_protocol::ParseError::InvalidUniverse { value: 64000 })
    ));
}

// ---------------------------------------------------------------------------
// 3. Sequence acceptance across stream interleaving
// ---------------------------------------------------------------------------

#[test]
fn interleaved_streams_share_one_counter() {
    // A source alternating levels and PAP emits consecutive sequence
    // numbers; every packet must clear the acceptance check.
    let mut prev = 250u8; // crosses the wrap
    for _ in 0..20 {
        let next = prev.wrapping_add(1);
        assert!(sequence_acceptable(prev, next));
        prev = next;
    }
}

#[test]
fn duplicate_sequence_rejected() {
    for seq in [0u8, 127, 255] {
        assert!(!sequence_acceptable(seq, seq));
    }
}

// ---------------------------------------------------------------------------
// 4. Merger driven by decoded packets
// ---------------------------------------------------------------------------

#[test]
fn merger_follows_decoded_traffic() {
    let a = cid(1);
    let b = cid(2);
    let mut merger = Merger::new();

    // Two consoles on the same universe, decoded off the wire.
    let mut frames = Vec::new();
    let mut levels_a = [0u8; UNIVERSE_SIZE];
    levels_a[..2].copy_from_slice(&[10, 200]);
    frames.push(DataFrame::new(
        a,
        &SourceName::new("console A"),
        Priority::default(),
        Universe::new(1).unwrap(),
        StartCode::Levels,
        &levels_a,
    ));
    let mut levels_b = [0u8; UNIVERSE_SIZE];
    levels_b[..2].copy_from_slice(&[50, 100]);
    frames.push(DataFrame::new(
        b,
        &SourceName::new("console B"),
        Priority::default(),
        Universe::new(1).unwrap(),
        StartCode::Levels,
        &levels_b,
    ));

    for frame in &frames {
        let Ok(Packet::Data(packet)) = Packet::parse(frame.as_bytes()) else {
            panic!("frame must parse");
        };
        if !merger.contains_source(&packet.cid) {
            merger.add_source(packet.cid).unwrap();
        }
        merger
            .update_universe_priority(&packet.cid, packet.priority)
            .unwrap();
        merger.update_levels(&packet.cid, &packet.values).unwrap();
    }

    assert_eq!(merger.levels()[0], 50);
    assert_eq!(merger.levels()[1], 200);
    assert_eq!(merger.winner(0), Some(b));
    assert_eq!(merger.winner(1), Some(a));
    assert_eq!(merger.active_sources().len(), 2);
}

#[test]
fn merger_pap_from_wire_beats_universe_priority() {
    let a = cid(1);
    let b = cid(2);
    let mut merger = Merger::new();
    merger.add_source(a).unwrap();
    merger.add_source(b).unwrap();
    merger
        .update_universe_priority(&a, Priority::new(200).unwrap())
        .unwrap();
    merger.update_levels(&a, &[100, 100]).unwrap();
    merger
        .update_universe_priority(&b, Priority::new(100).unwrap())
        .unwrap();
    merger.update_levels(&b, &[50, 50]).unwrap();

    // B's PAP stream arrives off the wire.
    let mut pap = [0u8; UNIVERSE_SIZE];
    pap[0] = 255;
    let frame = DataFrame::new(
        b,
        &SourceName::new("console B"),
        Priority::new(100).unwrap(),
        Universe::new(1).unwrap(),
        StartCode::PerAddressPriority,
        &pap,
    );
    let Ok(Packet::Data(packet)) = Packet::parse(frame.as_bytes()) else {
        panic!("PAP frame must parse");
    };
    merger.update_pap(&packet.cid, &packet.values).unwrap();

    assert_eq!(merger.winner(0), Some(b));
    assert_eq!(merger.levels()[0], 50);
    // PAP 0 on slot 1 unsources B there.
    assert_eq!(merger.winner(1), Some(a));
    assert_eq!(merger.levels()[1], 100);
}
