//! Inside-facing ingress tests: outbound resolution, buffering triggers,
//! control frames, and the forward-secrecy hold-back.

use super::*;
use crate::wire::{CTRL_MARKER, FLAG_CTRLMSG, FLAG_PATHFINDER, SWITCH_HEADER_SIZE};

#[test]
fn test_unroutable_frame_is_buffered_with_one_search() {
    let mut bed = make_bed();
    let dest = addr(2);
    let frame = inside_frame(&dest, PublicKey::zero(), 0, 0, 0, CONTENT_IP6, b"payload");

    bed.mgr.handle_inside_frame(frame, 1_000);

    assert_eq!(bed.mgr.buffered_count(), 1);
    assert_eq!(bed.mgr.session_count(), 0);
    assert!(drain(&mut bed.switch_rx).is_empty());

    let events = drain_events(&mut bed.event_rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, CoreEvent::SearchReq);
    assert_eq!(&events[0].2[..16], dest.as_bytes());
}

#[test]
fn test_outbound_with_key_and_version_creates_maintained_session() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    let peer = Peer::new(&us);

    let frame = inside_frame(
        &peer.addr(),
        *peer.identity.public_key(),
        20,
        0x13,
        0,
        CONTENT_IP6,
        b"payload",
    );
    bed.mgr.handle_inside_frame(frame, 1_000);

    // The session exists, but user traffic is held until the key arrives.
    assert_eq!(bed.mgr.session_count(), 1);
    assert_eq!(bed.mgr.buffered_count(), 1);
    assert!(drain(&mut bed.switch_rx).is_empty());

    let slot = bed.mgr.table.slot_by_ip(&peer.addr()).unwrap();
    let sess = bed.mgr.table.get_slot(slot).unwrap();
    assert!(sess.maintain_session);
    assert_eq!(sess.metric, crate::metric::SM_SEND);
    assert_eq!(sess.version, 20);

    let events = drain_events(&mut bed.event_rx);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, CoreEvent::Session);
    assert_eq!(events[1].0, CoreEvent::SearchReq);
}

#[test]
fn test_pathfinder_flag_clears_maintain() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    let peer = Peer::new(&us);

    let frame = inside_frame(
        &peer.addr(),
        *peer.identity.public_key(),
        20,
        0x13,
        FLAG_PATHFINDER,
        CONTENT_IP6,
        b"payload",
    );
    bed.mgr.handle_inside_frame(frame, 1_000);

    let slot = bed.mgr.table.slot_by_ip(&peer.addr()).unwrap();
    assert!(!bed.mgr.table.get_slot(slot).unwrap().maintain_session);
}

#[test]
fn test_dht_flows_before_session_is_ready() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    let peer = Peer::new(&us);

    let frame = inside_frame(
        &peer.addr(),
        *peer.identity.public_key(),
        20,
        0x13,
        0,
        CONTENT_DHT,
        b"dht ping",
    );
    bed.mgr.handle_inside_frame(frame, 1_000);

    // The DHT channel is exempt: a hello goes straight out.
    let sent = drain(&mut bed.switch_rx);
    assert_eq!(sent.len(), 1);
    let sh = SwitchHeader::parse(&sent[0]).unwrap();
    assert_eq!(sh.label, 0x13);
    assert_eq!(bed.mgr.buffered_count(), 0);
}

#[test]
fn test_dht_without_route_is_dropped_not_buffered() {
    let mut bed = make_bed();
    let frame = inside_frame(&addr(2), PublicKey::zero(), 0, 0, 0, CONTENT_DHT, b"dht");

    bed.mgr.handle_inside_frame(frame, 1_000);

    assert_eq!(bed.mgr.buffered_count(), 0);
    assert!(drain(&mut bed.event_rx).is_empty());
    assert!(drain(&mut bed.switch_rx).is_empty());
}

#[test]
fn test_missing_label_falls_back_to_session_label() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    let mut peer = Peer::new(&us);

    // Session learns its path from the peer's handshake.
    bed.mgr
        .handle_switch_frame(peer.handshake_frame(0x13, CONTENT_DHT, b"x", 0), 1_000);
    drain(&mut bed.inside_rx);
    drain(&mut bed.event_rx);

    // Outbound DHT frame with no label: the session's send label fills in.
    let frame = inside_frame(&peer.addr(), PublicKey::zero(), 20, 0, 0, CONTENT_DHT, b"y");
    bed.mgr.handle_inside_frame(frame, 2_000);

    let sent = drain(&mut bed.switch_rx);
    assert_eq!(sent.len(), 1);
    let sh = SwitchHeader::parse(&sent[0]).unwrap();
    assert_eq!(sh.label, 0x13);
}

#[test]
fn test_unknown_version_buffers_even_with_label() {
    let mut bed = make_bed();
    let dest = addr(9);
    // A label but no version and no key: still unroutable.
    let frame = inside_frame(&dest, PublicKey::zero(), 0, 0x44, 0, CONTENT_IP6, b"p");

    bed.mgr.handle_inside_frame(frame, 1_000);

    assert_eq!(bed.mgr.buffered_count(), 1);
    assert_eq!(bed.mgr.session_count(), 0);
    let events = drain_events(&mut bed.event_rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, CoreEvent::SearchReq);
}

#[test]
fn test_outgoing_ctrl_frame() {
    let mut bed = make_bed();
    let rh = RouteHeader {
        switch: SwitchHeader::for_label(0x77),
        flags: FLAG_CTRLMSG,
        ..Default::default()
    };
    let mut frame = rh.encode().to_vec();
    frame.extend_from_slice(b"ping body");

    bed.mgr.handle_inside_frame(frame, 1_000);

    let sent = drain(&mut bed.switch_rx);
    assert_eq!(sent.len(), 1);
    let sh = SwitchHeader::parse(&sent[0]).unwrap();
    assert_eq!(sh.label, 0x77);
    let marker = u32::from_be_bytes(sent[0][12..16].try_into().unwrap());
    assert_eq!(marker, CTRL_MARKER);
    assert_eq!(&sent[0][SWITCH_HEADER_SIZE + 4..], b"ping body");
}

#[test]
fn test_ctrl_frame_with_destination_is_dropped() {
    let mut bed = make_bed();
    let rh = RouteHeader {
        switch: SwitchHeader::for_label(0x77),
        flags: FLAG_CTRLMSG,
        ip6: *addr(1).as_bytes(),
        ..Default::default()
    };
    let mut frame = rh.encode().to_vec();
    frame.extend_from_slice(b"body");

    bed.mgr.handle_inside_frame(frame, 1_000);

    assert!(drain(&mut bed.switch_rx).is_empty());
}

#[test]
fn test_invalid_destination_address_is_dropped() {
    let mut bed = make_bed();
    let rh = RouteHeader {
        switch: SwitchHeader::default(),
        version: 20,
        ip6: [0x20; 16], // not an fc address
        ..Default::default()
    };
    let mut frame = rh.encode().to_vec();
    frame.extend_from_slice(&DataHeader::for_content(CONTENT_IP6).encode());
    frame.extend_from_slice(b"p");

    bed.mgr.handle_inside_frame(frame, 1_000);

    assert_eq!(bed.mgr.buffered_count(), 0);
    assert!(drain(&mut bed.switch_rx).is_empty());
    assert!(drain(&mut bed.event_rx).is_empty());
}
