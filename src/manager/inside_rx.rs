//! Inside-facing ingress: plaintext frames from upper layers, and the
//! encrypt path that turns them into switch datagrams.

use tracing::{debug, warn};

use crate::identity::Ip6;
use crate::metric;
use crate::wire::{
    DataHeader, RouteHeader, SwitchHeader, CONTENT_DHT, CTRL_MARKER, DATA_HEADER_SIZE,
    FLAG_CTRLMSG, FLAG_PATHFINDER, ROUTE_HEADER_SIZE, SWITCH_HEADER_SIZE,
};

use super::SessionManager;

impl SessionManager {
    /// Handle one plaintext datagram from the inside interface.
    ///
    /// The frame starts with a route header naming the destination. A frame
    /// that cannot be sent yet — unknown version, unknown path, or user
    /// traffic on a session that has not reached the key-received state —
    /// is parked in the buffer and a route search is triggered.
    pub fn handle_inside_frame(&mut self, mut frame: Vec<u8>, now_ms: u64) {
        let Some(rh) = RouteHeader::parse(&frame) else {
            debug!("DROP runt frame from inside");
            return;
        };
        if rh.flags & FLAG_CTRLMSG != 0 {
            self.outgoing_ctrl_frame(frame, &rh);
            return;
        }
        if frame.len() < ROUTE_HEADER_SIZE + DATA_HEADER_SIZE {
            debug!("DROP inside frame without data header");
            return;
        }
        let dh = DataHeader::parse(&frame[ROUTE_HEADER_SIZE..]).expect("length checked");
        let Ok(ip) = Ip6::from_slice(&rh.ip6) else {
            debug!("DROP inside frame with invalid destination address");
            return;
        };

        let slot = match self.table.checked_slot_by_ip(&ip) {
            Some(slot) => slot,
            None => {
                if !rh.has_zero_key() && rh.version != 0 {
                    self.get_or_create(
                        ip,
                        rh.public_key,
                        rh.version,
                        rh.switch.label,
                        metric::SM_SEND,
                        rh.flags & FLAG_PATHFINDER == 0,
                        now_ms,
                    )
                } else {
                    self.needs_lookup(frame, now_ms);
                    return;
                }
            }
        };

        let version_unknown = {
            let sess = self.table.get_slot_mut(slot).expect("slot is live");
            if rh.version != 0 {
                sess.version = rh.version;
            }
            sess.version == 0
        };
        if version_unknown {
            self.needs_lookup(frame, now_ms);
            return;
        }

        if rh.switch.label == 0 {
            let send_label = self.table.get_slot(slot).expect("slot is live").send_switch_label;
            if send_label != 0 {
                let sh = SwitchHeader::for_label(send_label);
                frame[..SWITCH_HEADER_SIZE].copy_from_slice(&sh.encode());
            } else {
                self.needs_lookup(frame, now_ms);
                return;
            }
        }

        // Forward secrecy: until the peer's key arrives, only the DHT
        // channel may flow.
        let hold_for_setup = {
            let sess = self.table.get_slot_mut(slot).expect("slot is live");
            sess.cipher.reset_if_timeout(now_ms);
            dh.content_type != CONTENT_DHT && !sess.cipher.state().is_ready_for_data()
        };
        if hold_for_setup {
            self.needs_lookup(frame, now_ms);
            return;
        }

        self.ready_to_send(frame, slot, now_ms);
    }

    /// Outbound control frame: strip the route header, prepend the control
    /// marker and switch header, and hand it to the fabric.
    fn outgoing_ctrl_frame(&self, frame: Vec<u8>, rh: &RouteHeader) {
        if !rh.has_zero_key() || !rh.has_zero_ip6() {
            debug!("DROP ctrl frame with non-zero destination key or address");
            return;
        }
        let mut out = Vec::with_capacity(frame.len() - ROUTE_HEADER_SIZE + SWITCH_HEADER_SIZE + 4);
        out.extend_from_slice(&rh.switch.encode());
        out.extend_from_slice(&CTRL_MARKER.to_be_bytes());
        out.extend_from_slice(&frame[ROUTE_HEADER_SIZE..]);
        self.send_to_switch(out);
    }

    /// Park a frame that cannot be routed yet and ask for a search.
    fn needs_lookup(&mut self, frame: Vec<u8>, now_ms: u64) {
        let rh = RouteHeader::parse(&frame).expect("caller parsed the route header");
        let Some(dh) = DataHeader::parse(&frame[ROUTE_HEADER_SIZE..]) else {
            debug!("DROP unroutable frame without data header");
            return;
        };
        if dh.content_type == CONTENT_DHT {
            // DHT traffic always carries full route information; buffering
            // it points at a bug in the upper layer.
            debug!("DROP dht frame lacking version, key, or path");
            return;
        }
        let Ok(ip) = Ip6::from_slice(&rh.ip6) else {
            debug!("DROP unroutable frame with invalid destination address");
            return;
        };
        debug!(ip = %ip, "buffering a frame and starting a search");
        let version = rh.version;
        if self.buffered.insert(ip, frame, now_ms) {
            self.trigger_search(&ip, version);
        }
    }

    /// The encrypt path: strip the route header, run the cipher session,
    /// and emit the finished switch datagram.
    pub(crate) fn ready_to_send(&mut self, frame: Vec<u8>, slot: usize, now_ms: u64) {
        if frame.len() < ROUTE_HEADER_SIZE + DATA_HEADER_SIZE {
            debug!("DROP short frame on the encrypt path");
            return;
        }
        let rh = RouteHeader::parse(&frame).expect("length checked");
        let dh = DataHeader::parse(&frame[ROUTE_HEADER_SIZE..]).expect("length checked");
        let payload = &frame[ROUTE_HEADER_SIZE..];

        let sess = self.table.get_slot_mut(slot).expect("slot is live");
        if dh.content_type != CONTENT_DHT {
            sess.time_of_last_out = now_ms;
        }
        sess.cipher.reset_if_timeout(now_ms);

        let plaintext = if !sess.cipher.state().is_ready_for_data() {
            // During setup the peer learns how to address us from the
            // handle buried in the authenticated payload.
            let mut buf = Vec::with_capacity(4 + payload.len());
            buf.extend_from_slice(&sess.receive_handle.to_be_bytes());
            buf.extend_from_slice(payload);
            buf
        } else {
            payload.to_vec()
        };

        sess.bytes_out += plaintext.len() as u64;
        let wire_packet = match sess.cipher.encrypt(&plaintext, now_ms) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(ip = %sess.addr, error = %err, "DROP frame, encrypt failed");
                return;
            }
        };

        let sh = if rh.switch.label != 0 {
            rh.switch
        } else {
            SwitchHeader::for_label(sess.send_switch_label)
        };

        let mut out = Vec::with_capacity(SWITCH_HEADER_SIZE + 4 + wire_packet.len());
        out.extend_from_slice(&sh.encode());
        if sess.cipher.state().is_ready_for_data() {
            out.extend_from_slice(&sess.send_handle.to_be_bytes());
        }
        out.extend_from_slice(&wire_packet);

        self.send_to_switch(out);
    }
}
