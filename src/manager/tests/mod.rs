use super::*;
use crate::cipher::CipherSession;
use crate::event::{CoreEvent, NodeRecord, PathfinderEvent};
use crate::identity::{Identity, Ip6, PublicKey};
use crate::wire::{
    reverse_label, DataHeader, RouteHeader, SwitchHeader, CONTENT_DHT, CONTENT_IP6,
    DATA_HEADER_SIZE, ROUTE_HEADER_SIZE,
};

mod inside_path;
mod switch_path;

pub(super) struct TestBed {
    pub mgr: SessionManager,
    pub switch_rx: FrameRx,
    pub inside_rx: FrameRx,
    pub event_rx: FrameRx,
}

pub(super) fn make_bed() -> TestBed {
    make_bed_with_config(SessionConfig::default())
}

pub(super) fn make_bed_with_config(config: SessionConfig) -> TestBed {
    let (switch_tx, switch_rx) = frame_channel();
    let (inside_tx, inside_rx) = frame_channel();
    let (event_tx, event_rx) = frame_channel();
    let mgr = SessionManager::new(Identity::generate(), config, switch_tx, inside_tx, event_tx);
    TestBed {
        mgr,
        switch_rx,
        inside_rx,
        event_rx,
    }
}

pub(super) fn drain(rx: &mut FrameRx) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Parse every drained event frame into `(event, pathfinder_id, payload)`.
pub(super) fn drain_events(rx: &mut FrameRx) -> Vec<(CoreEvent, u32, Vec<u8>)> {
    drain(rx)
        .iter()
        .map(|frame| {
            let (tag, id, payload) = event::parse_frame(frame).expect("well-formed event frame");
            (
                CoreEvent::from_tag(tag).expect("known core event"),
                id,
                payload.to_vec(),
            )
        })
        .collect()
}

pub(super) fn addr(tail: u8) -> Ip6 {
    let mut bytes = [0u8; 16];
    bytes[0] = 0xfc;
    bytes[15] = tail;
    Ip6::from_bytes(bytes).unwrap()
}

/// Build an inside-interface frame: route header, data header, payload.
#[allow(clippy::too_many_arguments)]
pub(super) fn inside_frame(
    ip: &Ip6,
    key: PublicKey,
    version: u32,
    label: u64,
    flags: u8,
    content_type: u16,
    payload: &[u8],
) -> Vec<u8> {
    let switch = if label != 0 {
        SwitchHeader::for_label(label)
    } else {
        SwitchHeader::default()
    };
    let rh = RouteHeader {
        switch,
        public_key: key,
        version,
        flags,
        ip6: *ip.as_bytes(),
    };
    let mut frame = rh.encode().to_vec();
    frame.extend_from_slice(&DataHeader::for_content(content_type).encode());
    frame.extend_from_slice(payload);
    frame
}

/// Wrap a cipher packet the way the fabric would deliver it: switch header
/// whose label field carries the bit-reversed forward label.
pub(super) fn switch_frame(forward_label: u64, packet: &[u8]) -> Vec<u8> {
    let sh = SwitchHeader::for_label(reverse_label(forward_label));
    let mut frame = sh.encode().to_vec();
    frame.extend_from_slice(packet);
    frame
}

/// A remote peer driving its own side of the cipher handshake.
pub(super) struct Peer {
    pub identity: Identity,
    pub cipher: CipherSession,
    /// The receive handle this peer announces for itself.
    pub handle: u32,
}

impl Peer {
    pub fn new(us: &Identity) -> Self {
        let identity = Identity::generate();
        let cipher = CipherSession::new(identity.clone(), *us.public_key(), 0);
        Self {
            identity,
            cipher,
            handle: 0x0202_0202,
        }
    }

    pub fn addr(&self) -> Ip6 {
        *self.identity.addr()
    }

    /// Setup-phase plaintext: the peer's handle, a data header, payload.
    pub fn setup_plaintext(&self, content_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut pt = self.handle.to_be_bytes().to_vec();
        pt.extend_from_slice(&DataHeader::for_content(content_type).encode());
        pt.extend_from_slice(payload);
        pt
    }

    /// An initial handshake frame toward the test bed, as delivered by the
    /// fabric.
    pub fn handshake_frame(
        &mut self,
        forward_label: u64,
        content_type: u16,
        payload: &[u8],
        now_ms: u64,
    ) -> Vec<u8> {
        let pt = self.setup_plaintext(content_type, payload);
        let packet = self.cipher.encrypt(&pt, now_ms).unwrap();
        switch_frame(forward_label, &packet)
    }
}

/// Drive the bed's session for `peer` to `ReceivedKey` with the bed as
/// initiator: a DHT frame from the inside makes the bed emit its hello,
/// the peer answers with its key packet, and the answer is fed back
/// through switch ingress. Requires the bed to already hold a session for
/// the peer with a known key, version, and path.
pub(super) fn complete_handshake_as_initiator(bed: &mut TestBed, peer: &mut Peer, now_ms: u64) {
    // A DHT frame is allowed out before the session is ready; it makes the
    // bed send its hello.
    let dht = inside_frame(
        &peer.addr(),
        *peer.identity.public_key(),
        20,
        0x13,
        0,
        CONTENT_DHT,
        b"ping",
    );
    bed.mgr.handle_inside_frame(dht, now_ms);
    let sent = drain(&mut bed.switch_rx);
    assert_eq!(sent.len(), 1, "expected the bed to emit its hello");

    // The peer answers with its key packet.
    let hello_body = &sent[0][crate::wire::SWITCH_HEADER_SIZE..];
    peer.cipher.decrypt(hello_body, now_ms).unwrap();
    let pt = peer.setup_plaintext(CONTENT_DHT, b"pong");
    let key_packet = peer.cipher.encrypt(&pt, now_ms).unwrap();
    bed.mgr
        .handle_switch_frame(switch_frame(0x13, &key_packet), now_ms);
    drain(&mut bed.inside_rx);
    drain(&mut bed.event_rx);
}
