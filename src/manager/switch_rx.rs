//! Switch-side ingress: encrypted frames arriving from the routing fabric.

use tracing::debug;

use crate::cipher::{CipherSession, CRYPTO_HEADER_SIZE, FIRST_DATA_NONCE, STAGE_REPEAT_KEY, TAG_SIZE};
use crate::event::{CoreEvent, NodeRecord, BROADCAST};
use crate::identity::Ip6;
use crate::metric;
use crate::wire::{
    self, reverse_label, DataHeader, RouteHeader, SwitchHeader, CONTENT_DHT, CTRL_MARKER,
    FLAG_CTRLMSG, FLAG_INCOMING, ROUTE_HEADER_SIZE, SWITCH_HEADER_SIZE,
};

use super::SessionManager;

impl SessionManager {
    /// Handle one datagram from the switch.
    ///
    /// Layout after the 12-byte switch header is a 4-byte word that
    /// dispatches the frame: `0xFFFFFFFF` marks a control frame, values
    /// above 3 are a receive handle on an established session, and 0–3 are
    /// handshake stage words.
    pub fn handle_switch_frame(&mut self, frame: Vec<u8>, now_ms: u64) {
        if frame.len() < SWITCH_HEADER_SIZE + 4 {
            debug!("DROP runt frame from switch");
            return;
        }
        let mut sh = SwitchHeader::parse(&frame).expect("length checked");
        // The fabric delivers labels reversed; bit-reversing yields the
        // forward path back to the sender.
        sh.label = reverse_label(sh.label);

        let body = &frame[SWITCH_HEADER_SIZE..];
        let nonce_or_handle = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);

        if nonce_or_handle == CTRL_MARKER {
            self.incoming_ctrl_frame(sh, &body[4..]);
            return;
        }
        if body.len() < 24 {
            debug!("DROP runt frame from switch");
            return;
        }

        // Kept for the error reply if decryption fails below.
        let mut first_sixteen = [0u8; 16];
        first_sixteen.copy_from_slice(&body[..16]);

        let (slot, ciphertext_offset) = if nonce_or_handle > STAGE_REPEAT_KEY {
            // Data frame addressed by handle.
            let Some(slot) = self.table.checked_slot_by_handle(nonce_or_handle) else {
                debug!(handle = nonce_or_handle, "DROP frame with unrecognized handle");
                return;
            };
            let nonce = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
            if nonce < FIRST_DATA_NONCE {
                // A setup stage never travels together with a handle.
                debug!(
                    nonce,
                    handle = nonce_or_handle,
                    "DROP setup message with explicit handle"
                );
                return;
            }
            (slot, 4)
        } else {
            // Handshake frame: the session is keyed by the address the
            // sender's public key derives.
            if body.len() < CRYPTO_HEADER_SIZE + TAG_SIZE + 4 {
                debug!("DROP runt handshake frame");
                return;
            }
            let Some(public_key) = CipherSession::handshake_public_key(body) else {
                debug!("DROP malformed handshake header");
                return;
            };
            let Some(ip) = Ip6::for_public_key(&public_key) else {
                debug!("DROP handshake whose key has no fc address");
                return;
            };
            if public_key == *self.identity.public_key() {
                debug!("DROP handshake from ourselves");
                return;
            }
            let slot = self.get_or_create(
                ip,
                public_key,
                0,
                sh.label,
                metric::SM_INCOMING,
                false,
                now_ms,
            );
            let sess = self.table.get_slot_mut(slot).expect("just resolved");
            sess.cipher.reset_if_timeout(now_ms);
            debug!(ip = %ip, stage = nonce_or_handle, "handshake frame");
            (slot, 0)
        };

        let is_setup = nonce_or_handle <= STAGE_REPEAT_KEY;
        let sess = self.table.get_slot_mut(slot).expect("slot is live");
        match sess.cipher.decrypt(&body[ciphertext_offset..], now_ms) {
            Ok(plaintext) => self.forward_decrypted(slot, sh, is_setup, plaintext, now_ms),
            Err(err) => {
                let state = sess.cipher.state();
                debug!(
                    ip = %sess.addr,
                    error = %err,
                    state = %state,
                    "DROP failed decrypting frame from switch"
                );
                // The reversed label is the return path toward the sender.
                let reply = wire::build_auth_error_frame(
                    sh.label,
                    &first_sixteen,
                    err.code(),
                    state.code(),
                );
                self.send_to_switch(reply);
            }
        }
    }

    /// Control frames bypass the session layer entirely: wrap them in a
    /// route header and hand them inside.
    fn incoming_ctrl_frame(&self, sh: SwitchHeader, payload: &[u8]) {
        let rh = RouteHeader {
            switch: sh,
            flags: FLAG_INCOMING | FLAG_CTRLMSG,
            ..Default::default()
        };
        let mut out = rh.encode().to_vec();
        out.extend_from_slice(payload);
        self.send_inside(out);
    }

    /// A frame decrypted: account for it, learn paths, inflate the route
    /// header, and deliver inside.
    fn forward_decrypted(
        &mut self,
        slot: usize,
        sh: SwitchHeader,
        is_setup: bool,
        mut plaintext: Vec<u8>,
        now_ms: u64,
    ) {
        let sess = self.table.get_slot_mut(slot).expect("slot is live");

        if is_setup {
            // The first decrypted word of a handshake payload is the handle
            // the peer wants stamped on data frames we send it.
            if plaintext.len() < 4 {
                debug!(ip = %sess.addr, "DROP handshake payload too short for a handle");
                return;
            }
            sess.send_handle =
                u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
            plaintext.drain(..4);
        }

        let Some(dh) = DataHeader::parse(&plaintext) else {
            debug!(ip = %sess.addr, "DROP decrypted frame too short for a data header");
            return;
        };
        if dh.content_type != CONTENT_DHT {
            sess.time_of_last_in = now_ms;
        }
        sess.time_of_keep_alive_in = now_ms;

        let path = sh.label;
        if sess.send_switch_label == 0 {
            sess.send_switch_label = path;
        }
        let discovered = path != sess.recv_switch_label;
        if discovered {
            sess.recv_switch_label = path;
        }

        let rh = RouteHeader {
            switch: sh,
            public_key: *sess.cipher.her_public_key(),
            version: sess.version,
            flags: FLAG_INCOMING,
            ip6: *sess.addr.as_bytes(),
        };
        let mut out = Vec::with_capacity(ROUTE_HEADER_SIZE + plaintext.len());
        out.extend_from_slice(&rh.encode());
        out.extend_from_slice(&plaintext);
        sess.bytes_in += out.len() as u64;

        let record = discovered.then(|| NodeRecord {
            path,
            metric: sess.metric,
            version: sess.version,
            public_key: *sess.cipher.her_public_key(),
            ip6: *sess.addr.as_bytes(),
        });

        if let Some(record) = record {
            self.emit(CoreEvent::DiscoveredPath, BROADCAST, &record.encode());
        }
        self.send_inside(out);
    }
}
