//! Event-bus endpoint: node discoveries and enumeration requests from
//! pathfinders.

use tracing::debug;

use crate::event::{self, CoreEvent, NodeRecord, PathfinderEvent};
use crate::identity::Ip6;
use crate::metric;

use super::SessionManager;

impl SessionManager {
    /// Handle one frame from the event bus.
    pub fn handle_event_frame(&mut self, frame: Vec<u8>, now_ms: u64) {
        let Some((tag, source_pathfinder, payload)) = event::parse_frame(&frame) else {
            debug!("DROP malformed event frame");
            return;
        };
        match PathfinderEvent::from_tag(tag) {
            Some(PathfinderEvent::Sessions) => self.announce_sessions(source_pathfinder),
            Some(PathfinderEvent::Node) => {
                let Some(record) = NodeRecord::decode(payload) else {
                    debug!("DROP node event with short payload");
                    return;
                };
                self.handle_node_event(record, now_ms);
            }
            None => debug!(tag, "ignoring unhandled event"),
        }
    }

    /// Re-announce every live session, targeted at the asking pathfinder.
    fn announce_sessions(&self, pathfinder_id: u32) {
        for slot in 0..self.table.slot_count() {
            let Some(sess) = self.table.get_slot(slot) else {
                continue;
            };
            let record = self.node_record(slot, sess.send_switch_label);
            self.emit(CoreEvent::Session, pathfinder_id, &record.encode());
        }
    }

    /// A pathfinder discovered (or lost) a node.
    ///
    /// Ignored unless we hold a session or a buffered frame for the
    /// address. A usable discovery feeds [`SessionManager::get_or_create`];
    /// if it leaves the session ready, any parked frame is flushed through
    /// the encrypt path, otherwise the pathfinder is nudged to finish the
    /// setup signalling.
    fn handle_node_event(&mut self, record: NodeRecord, now_ms: u64) {
        let Ok(ip) = Ip6::from_slice(&record.ip6) else {
            debug!("DROP node event with invalid address");
            return;
        };
        if self.table.slot_by_ip(&ip).is_none() {
            if !self.buffered.contains(&ip) {
                // A node we care nothing about.
                return;
            }
            if record.metric == metric::DEAD_LINK {
                // A broken path to a node we have no session for.
                return;
            }
        }

        let slot = self.get_or_create(
            ip,
            record.public_key,
            record.version,
            record.path,
            record.metric,
            false,
            now_ms,
        );

        let ready = self
            .table
            .get_slot(slot)
            .expect("slot is live")
            .cipher
            .state()
            .is_ready_for_data();
        if ready {
            if let Some(buffered) = self.buffered.take(&ip) {
                debug!(ip = %ip, "flushing buffered frame after discovery");
                self.ready_to_send(buffered.frame, slot, now_ms);
            }
        } else {
            self.emit_unsetup(slot);
        }
    }
}
