//! Switch-side ingress tests: handshake acceptance, dispatch, drops, and
//! the failed-decrypt error reply.

use super::*;
use crate::wire::{ControlError, CTRL_MARKER, ERROR_AUTHENTICATION, FLAG_CTRLMSG, FLAG_INCOMING};

#[test]
fn test_handshake_creates_session_and_forwards_inside() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    let mut peer = Peer::new(&us);

    let frame = peer.handshake_frame(0x13, CONTENT_IP6, b"user payload", 0);
    bed.mgr.handle_switch_frame(frame, 1_000);

    // One session, holding the very first handle of the random base.
    assert_eq!(bed.mgr.session_count(), 1);
    let page = bed.mgr.handle_page(0);
    assert_eq!(page.handles.len(), 1);
    let handle = page.handles[0];
    assert_eq!(handle, bed.mgr.table.first_handle());

    let stats = bed.mgr.session_stats(handle).unwrap();
    assert_eq!(stats.ip6, peer.addr());
    assert_eq!(stats.send_handle, peer.handle);
    assert_eq!(stats.metric, crate::metric::SM_INCOMING);

    // Session announcement, then the discovered return path.
    let events = drain_events(&mut bed.event_rx);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, CoreEvent::Session);
    assert_eq!(events[0].1, crate::event::BROADCAST);
    let record = NodeRecord::decode(&events[0].2).unwrap();
    assert_eq!(record.ip6, *peer.addr().as_bytes());
    assert_eq!(events[1].0, CoreEvent::DiscoveredPath);
    let record = NodeRecord::decode(&events[1].2).unwrap();
    assert_eq!(record.path, 0x13);

    // The decrypted body went inside under a filled-in route header.
    let inside = drain(&mut bed.inside_rx);
    assert_eq!(inside.len(), 1);
    let rh = RouteHeader::parse(&inside[0]).unwrap();
    assert_eq!(rh.flags, FLAG_INCOMING);
    assert_eq!(rh.ip6, *peer.addr().as_bytes());
    assert_eq!(rh.public_key, *peer.identity.public_key());
    assert_eq!(rh.switch.label, 0x13);
    assert_eq!(
        &inside[0][ROUTE_HEADER_SIZE + DATA_HEADER_SIZE..],
        b"user payload"
    );

    // Nothing went back out to the switch.
    assert!(drain(&mut bed.switch_rx).is_empty());
}

#[test]
fn test_failed_decrypt_produces_error_reply() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    let mut peer = Peer::new(&us);

    let mut frame = peer.handshake_frame(0x13, CONTENT_IP6, b"payload", 0);
    let last = frame.len() - 1;
    frame[last] ^= 0xff; // corrupt the ciphertext
    let first_sixteen: [u8; 16] = frame[12..28].try_into().unwrap();

    bed.mgr.handle_switch_frame(frame, 1_000);

    // Nothing reached the inside interface.
    assert!(drain(&mut bed.inside_rx).is_empty());

    // Exactly one reply on the switch side: a control error, routed back
    // along the sender's path, with suppress-errors set.
    let replies = drain(&mut bed.switch_rx);
    assert_eq!(replies.len(), 1);
    let sh = SwitchHeader::parse(&replies[0]).unwrap();
    assert_eq!(sh.label, 0x13);
    assert!(sh.suppress_errors);

    let marker = u32::from_be_bytes(replies[0][12..16].try_into().unwrap());
    assert_eq!(marker, CTRL_MARKER);

    let ctrl = ControlError::parse(&replies[0][16..]).unwrap();
    assert_eq!(ctrl.error_code, ERROR_AUTHENTICATION);
    assert_eq!(ctrl.first_sixteen, first_sixteen);
    assert_eq!(
        ctrl.decrypt_error,
        crate::cipher::DecryptError::AuthenticationFailed.code()
    );
}

#[test]
fn test_ctrl_frame_goes_inside_with_flags() {
    let mut bed = make_bed();
    let mut frame = SwitchHeader::for_label(reverse_label(0x13)).encode().to_vec();
    frame.extend_from_slice(&CTRL_MARKER.to_be_bytes());
    frame.extend_from_slice(b"control body");

    bed.mgr.handle_switch_frame(frame, 1_000);

    let inside = drain(&mut bed.inside_rx);
    assert_eq!(inside.len(), 1);
    let rh = RouteHeader::parse(&inside[0]).unwrap();
    assert_eq!(rh.flags, FLAG_INCOMING | FLAG_CTRLMSG);
    assert_eq!(rh.switch.label, 0x13);
    assert!(rh.has_zero_key());
    assert!(rh.has_zero_ip6());
    assert_eq!(&inside[0][ROUTE_HEADER_SIZE..], b"control body");
    assert_eq!(bed.mgr.session_count(), 0);
}

#[test]
fn test_runt_frames_are_dropped() {
    let mut bed = make_bed();
    bed.mgr.handle_switch_frame(vec![0u8; 15], 1_000);
    // Long enough for the dispatch word but not for a handshake header.
    let mut frame = SwitchHeader::for_label(1).encode().to_vec();
    frame.extend_from_slice(&2u32.to_be_bytes());
    frame.extend_from_slice(&[0u8; 30]);
    bed.mgr.handle_switch_frame(frame, 1_000);

    assert!(drain(&mut bed.switch_rx).is_empty());
    assert!(drain(&mut bed.inside_rx).is_empty());
    assert!(drain(&mut bed.event_rx).is_empty());
    assert_eq!(bed.mgr.session_count(), 0);
}

#[test]
fn test_unknown_handle_is_dropped_silently() {
    let mut bed = make_bed();
    let mut frame = SwitchHeader::for_label(reverse_label(0x13)).encode().to_vec();
    frame.extend_from_slice(&123_456u32.to_be_bytes()); // no such handle
    frame.extend_from_slice(&9u32.to_be_bytes()); // plausible data nonce
    frame.extend_from_slice(&[0u8; 32]);

    bed.mgr.handle_switch_frame(frame, 1_000);

    assert!(drain(&mut bed.switch_rx).is_empty());
    assert!(drain(&mut bed.inside_rx).is_empty());
}

#[test]
fn test_setup_nonce_with_handle_is_dropped() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    let mut peer = Peer::new(&us);
    bed.mgr
        .handle_switch_frame(peer.handshake_frame(0x13, CONTENT_IP6, b"x", 0), 1_000);
    let handle = bed.mgr.handle_page(0).handles[0];
    drain(&mut bed.switch_rx);
    drain(&mut bed.inside_rx);

    // A handle followed by a setup-stage word never happens legitimately.
    let mut frame = SwitchHeader::for_label(reverse_label(0x13)).encode().to_vec();
    frame.extend_from_slice(&handle.to_be_bytes());
    frame.extend_from_slice(&2u32.to_be_bytes()); // stage word, not a nonce
    frame.extend_from_slice(&[0u8; 32]);

    bed.mgr.handle_switch_frame(frame, 2_000);

    assert!(drain(&mut bed.switch_rx).is_empty());
    assert!(drain(&mut bed.inside_rx).is_empty());
}

#[test]
fn test_handshake_from_our_own_key_is_dropped() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    // A "peer" wielding our own identity: the loopback attack.
    let mut cipher = CipherSession::new(us.clone(), *us.public_key(), 0);
    let packet = cipher.encrypt(b"evil", 0).unwrap();

    bed.mgr
        .handle_switch_frame(switch_frame(0x13, &packet), 1_000);

    assert_eq!(bed.mgr.session_count(), 0);
    assert!(drain(&mut bed.switch_rx).is_empty());
    assert!(drain(&mut bed.inside_rx).is_empty());
}

#[test]
fn test_full_duplex_establishment() {
    let mut bed = make_bed();
    let us = bed.mgr.identity().clone();
    let mut peer = Peer::new(&us);

    // Peer initiates.
    bed.mgr
        .handle_switch_frame(peer.handshake_frame(0x13, CONTENT_DHT, b"hello", 0), 1_000);
    let handle = bed.mgr.handle_page(0).handles[0];
    drain(&mut bed.inside_rx);
    drain(&mut bed.event_rx);

    // The bed answers with its key packet when the inside pushes DHT
    // traffic toward the peer.
    let dht = inside_frame(
        &peer.addr(),
        *peer.identity.public_key(),
        20,
        0,
        0,
        CONTENT_DHT,
        b"reply",
    );
    bed.mgr.handle_inside_frame(dht, 2_000);
    let sent = drain(&mut bed.switch_rx);
    assert_eq!(sent.len(), 1);

    // The peer completes its side and learns our receive handle from the
    // key packet's payload.
    let body = &sent[0][crate::wire::SWITCH_HEADER_SIZE..];
    let pt = peer.cipher.decrypt(body, 2_000).unwrap();
    let our_handle = u32::from_be_bytes(pt[..4].try_into().unwrap());
    assert_eq!(our_handle, handle);
    assert!(peer.cipher.state().is_ready_for_data());

    // Peer now sends a data frame addressed by our handle.
    let mut data_pt = DataHeader::for_content(CONTENT_IP6).encode().to_vec();
    data_pt.extend_from_slice(b"real traffic");
    let packet = peer.cipher.encrypt(&data_pt, 3_000).unwrap();
    let mut frame = SwitchHeader::for_label(reverse_label(0x13)).encode().to_vec();
    frame.extend_from_slice(&handle.to_be_bytes());
    frame.extend_from_slice(&packet);
    bed.mgr.handle_switch_frame(frame, 3_000);

    let inside = drain(&mut bed.inside_rx);
    assert_eq!(inside.len(), 1);
    assert_eq!(
        &inside[0][ROUTE_HEADER_SIZE + DATA_HEADER_SIZE..],
        b"real traffic"
    );

    let stats = bed.mgr.session_stats(handle).unwrap();
    assert_eq!(stats.state, crate::cipher::SessionState::Established);
}
