//! Periodic housekeeping: session timeouts, search re-triggers, and buffer
//! expiry.

use tracing::debug;

use crate::event::{CoreEvent, NodeRecord, BROADCAST};
use crate::identity::Ip6;

use super::SessionManager;

enum Action {
    Nothing,
    Remove(NodeRecord),
    Search(Ip6, u32),
    Unsetup,
}

impl SessionManager {
    /// One housekeeping pass; the run loop fires this every ten seconds.
    pub fn tick(&mut self, now_ms: u64) {
        self.check_timed_out_sessions(now_ms);
        self.buffered.sweep(now_ms);
    }

    /// Walk the table back to front so removals never disturb slots still
    /// to be visited.
    fn check_timed_out_sessions(&mut self, now_ms: u64) {
        for slot in (0..self.table.slot_count()).rev() {
            let action = {
                let Some(sess) = self.table.get_slot_mut(slot) else {
                    continue;
                };
                if now_ms.saturating_sub(sess.time_of_keep_alive_in)
                    > self.config.session_timeout_ms
                {
                    Action::Remove(NodeRecord {
                        path: sess.send_switch_label,
                        metric: sess.metric,
                        version: sess.version,
                        public_key: *sess.cipher.her_public_key(),
                        ip6: *sess.addr.as_bytes(),
                    })
                } else if !sess.maintain_session {
                    // An external owner keeps this one alive.
                    Action::Nothing
                } else if now_ms.saturating_sub(sess.last_search_time)
                    >= self.config.session_search_after_ms
                {
                    sess.last_search_time = now_ms;
                    Action::Search(sess.addr, sess.version)
                } else if !sess.cipher.state().is_ready_for_data() {
                    Action::Unsetup
                } else {
                    Action::Nothing
                }
            };
            match action {
                Action::Nothing => {}
                Action::Remove(record) => {
                    debug!(ip = %record_ip(&record), "session ended");
                    self.table.remove_slot(slot);
                    self.emit(CoreEvent::SessionEnded, BROADCAST, &record.encode());
                }
                Action::Search(addr, version) => {
                    self.trigger_search(&addr, version);
                }
                Action::Unsetup => self.emit_unsetup(slot),
            }
        }
    }
}

fn record_ip(record: &NodeRecord) -> std::net::Ipv6Addr {
    std::net::Ipv6Addr::from(record.ip6)
}
