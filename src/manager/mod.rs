//! The session manager.
//!
//! Sits between the switch-facing interface (encrypted datagrams to and
//! from the routing fabric) and the inside-facing interface (plaintext
//! datagrams to and from upper layers), and talks to pathfinders over an
//! event bus. It owns every per-peer cipher session, the dual-keyed
//! address ⇄ handle table, and a short-term buffer of outbound frames
//! waiting for route resolution.
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative: [`SessionManager::run`] drives three
//! inbound channels plus a 10-second housekeeping tick through one
//! `select!` loop. Handlers take `&mut self` and a caller-supplied clock
//! value and run to completion — event emission is a synchronous channel
//! send, so anything a handler publishes is enqueued before it returns.
//!
//! Frames the manager produces leave through the owned `switch_tx`,
//! `inside_tx`, and `event_tx` senders.

mod admin;
mod buffer;
mod entry;
mod events;
mod housekeeping;
mod inside_rx;
mod switch_rx;
mod table;
#[cfg(test)]
mod tests;

pub use admin::{HandlePage, SessionStats, HANDLES_PER_PAGE};
pub use buffer::BUFFER_TIMEOUT_MS;
pub use table::{MAX_FIRST_HANDLE, MIN_FIRST_HANDLE};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cipher::CipherSession;
use crate::config::SessionConfig;
use crate::event::{self, CoreEvent, NodeRecord, BROADCAST};
use crate::identity::{Identity, Ip6, PublicKey};
use crate::metric;

use buffer::BufferedMessages;
use entry::Session;
use table::SessionTable;

/// How often the housekeeper runs.
pub const HOUSEKEEPING_INTERVAL_MS: u64 = 10_000;

/// Sender half of a frame channel.
pub type FrameTx = mpsc::UnboundedSender<Vec<u8>>;

/// Receiver half of a frame channel.
pub type FrameRx = mpsc::UnboundedReceiver<Vec<u8>>;

/// Create a frame channel connecting the manager to one of its interfaces.
pub fn frame_channel() -> (FrameTx, FrameRx) {
    mpsc::unbounded_channel()
}

pub struct SessionManager {
    identity: Identity,
    config: SessionConfig,
    table: SessionTable,
    buffered: BufferedMessages,
    switch_tx: FrameTx,
    inside_tx: FrameTx,
    event_tx: FrameTx,
}

impl SessionManager {
    /// Create a session manager wired to its three output interfaces.
    ///
    /// The handle base is drawn fresh from the thread RNG: handles are the
    /// only thing standing between a remote peer and forging data frames of
    /// another session, so the base must never be predictable.
    pub fn new(
        identity: Identity,
        config: SessionConfig,
        switch_tx: FrameTx,
        inside_tx: FrameTx,
        event_tx: FrameTx,
    ) -> Self {
        let first_handle = rand::thread_rng().gen_range(MIN_FIRST_HANDLE..MAX_FIRST_HANDLE);
        Self {
            identity,
            table: SessionTable::new(first_handle),
            buffered: BufferedMessages::new(config.max_buffered_messages),
            config,
            switch_tx,
            inside_tx,
            event_tx,
        }
    }

    /// This node's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// Number of frames parked awaiting route resolution.
    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    /// Drive the manager until every inbound channel has closed.
    ///
    /// All message handling happens inline on this task; the tick fires
    /// every [`HOUSEKEEPING_INTERVAL_MS`].
    pub async fn run(
        mut self,
        mut switch_rx: FrameRx,
        mut inside_rx: FrameRx,
        mut event_rx: FrameRx,
    ) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(HOUSEKEEPING_INTERVAL_MS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("session manager event loop started");
        loop {
            tokio::select! {
                frame = switch_rx.recv() => match frame {
                    Some(frame) => self.handle_switch_frame(frame, unix_time_ms()),
                    None => break,
                },
                frame = inside_rx.recv() => match frame {
                    Some(frame) => self.handle_inside_frame(frame, unix_time_ms()),
                    None => break,
                },
                frame = event_rx.recv() => match frame {
                    Some(frame) => self.handle_event_frame(frame, unix_time_ms()),
                    None => break,
                },
                _ = tick.tick() => self.tick(unix_time_ms()),
            }
        }
        info!("session manager event loop stopped (channel closed)");
    }

    // === Session resolution ===

    /// Find or create the session for `ip`, folding in whatever the caller
    /// learned about the peer. Returns the session's slot.
    ///
    /// For an existing session: the version is kept once known,
    /// `maintain` is sticky-OR, and the path is only replaced by one with
    /// an equal-or-better metric — except that a `DEAD_LINK` report for the
    /// current send path falls back to the return path (or clears the path
    /// entirely when both were the same).
    pub(crate) fn get_or_create(
        &mut self,
        ip: Ip6,
        public_key: PublicKey,
        version: u32,
        label: u64,
        metric_value: u32,
        maintain: bool,
        now_ms: u64,
    ) -> usize {
        if let Some(slot) = self.table.checked_slot_by_ip(&ip) {
            let sess = self.table.get_slot_mut(slot).expect("slot is live");
            if sess.version == 0 {
                sess.version = version;
            }
            sess.maintain_session |= maintain;
            if metric_value == metric::DEAD_LINK {
                if sess.send_switch_label == label {
                    debug!(ip = %ip, "broken path");
                    if sess.send_switch_label == sess.recv_switch_label {
                        sess.send_switch_label = 0;
                        sess.metric = metric::DEAD_LINK;
                    } else {
                        sess.send_switch_label = sess.recv_switch_label;
                        sess.metric = metric::SM_INCOMING;
                    }
                }
            } else if metric_value <= sess.metric && label != 0 {
                sess.send_switch_label = label;
                if version != 0 {
                    sess.version = version;
                }
                sess.metric = metric_value;
                debug!(ip = %ip, label, metric = metric_value, "discovered path");
            }
            return slot;
        }

        let cipher = CipherSession::new(self.identity.clone(), public_key, now_ms);
        let found_key = !public_key.is_zero();
        if found_key {
            assert_eq!(
                Ip6::for_public_key(&public_key),
                Some(ip),
                "public key does not derive the requested address"
            );
        }
        let sess = Session::new(
            ip,
            cipher,
            version,
            label,
            metric_value,
            maintain,
            found_key,
            now_ms,
        );
        let (slot, handle) = self.table.insert(sess);
        debug!(ip = %ip, handle, "created session");

        let record = self.node_record(slot, label);
        self.emit(CoreEvent::Session, BROADCAST, &record.encode());
        slot
    }

    // === Output helpers ===

    fn node_record(&self, slot: usize, path: u64) -> NodeRecord {
        let sess = self.table.get_slot(slot).expect("slot is live");
        NodeRecord {
            path,
            metric: sess.metric,
            version: sess.version,
            public_key: *sess.cipher.her_public_key(),
            ip6: *sess.addr.as_bytes(),
        }
    }

    pub(crate) fn emit(&self, ev: CoreEvent, pathfinder_id: u32, payload: &[u8]) {
        let frame = event::build_frame(ev.tag(), pathfinder_id, payload);
        if self.event_tx.send(frame).is_err() {
            debug!(event = ?ev, "event bus receiver is gone");
        }
    }

    pub(crate) fn send_to_switch(&self, frame: Vec<u8>) {
        if self.switch_tx.send(frame).is_err() {
            debug!("switch interface receiver is gone");
        }
    }

    pub(crate) fn send_inside(&self, frame: Vec<u8>) {
        if self.inside_tx.send(frame).is_err() {
            debug!("inside interface receiver is gone");
        }
    }

    /// Ask the pathfinders for a route to `target`.
    pub(crate) fn trigger_search(&self, target: &Ip6, version: u32) {
        debug!(target = %target, "requesting route search");
        self.emit(
            CoreEvent::SearchReq,
            BROADCAST,
            &event::search_payload(target, version),
        );
    }

    /// Tell the pathfinders a session is stuck below the key-received
    /// state. Pointless without a version and some label, so silent then.
    pub(crate) fn emit_unsetup(&self, slot: usize) {
        let sess = match self.table.get_slot(slot) {
            Some(sess) => sess,
            None => return,
        };
        if sess.version == 0 || (sess.send_switch_label == 0 && sess.recv_switch_label == 0) {
            return;
        }
        let path = if sess.send_switch_label != 0 {
            sess.send_switch_label
        } else {
            sess.recv_switch_label
        };
        let record = self.node_record(slot, path);
        self.emit(CoreEvent::UnsetupSession, BROADCAST, &record.encode());
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
