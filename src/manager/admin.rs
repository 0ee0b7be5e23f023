//! Read-only admin view: handle enumeration and per-session statistics.

use crate::cipher::SessionState;
use crate::identity::{self, Ip6};

use super::SessionManager;

/// Handles returned per enumeration page.
pub const HANDLES_PER_PAGE: usize = 8;

/// One page of the handle enumeration.
#[derive(Clone, Debug)]
pub struct HandlePage {
    pub handles: Vec<u32>,
    /// Whether further pages exist.
    pub more: bool,
}

/// Statistics for one session, keyed by its receive handle.
#[derive(Clone, Debug)]
pub struct SessionStats {
    /// Printable peer address (`v<version>.<label>.<key>k`).
    pub addr: String,
    /// The peer's overlay address.
    pub ip6: Ip6,
    pub state: SessionState,
    pub handle: u32,
    pub send_handle: u32,
    pub version: u32,
    pub metric: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub time_of_last_in: u64,
    pub time_of_last_out: u64,
    /// Replay-window counters from the cipher session.
    pub duplicates: u32,
    pub lost_packets: u32,
    pub received_out_of_range: u32,
}

impl SessionManager {
    /// Enumerate live handles, eight per page.
    pub fn handle_page(&self, page: usize) -> HandlePage {
        let all = self.table.list_handles();
        let start = (page * HANDLES_PER_PAGE).min(all.len());
        let end = (start + HANDLES_PER_PAGE).min(all.len());
        HandlePage {
            handles: all[start..end].to_vec(),
            more: end < all.len(),
        }
    }

    /// Statistics for the session behind `handle`, if it is live.
    pub fn session_stats(&mut self, handle: u32) -> Option<SessionStats> {
        let sess = self.table.get_by_handle(handle)?;
        let replay = sess.cipher.replay_stats();
        Some(SessionStats {
            addr: identity::format_address(
                sess.version,
                sess.send_switch_label,
                sess.cipher.her_public_key(),
            ),
            ip6: sess.addr,
            state: sess.state(),
            handle: sess.receive_handle,
            send_handle: sess.send_handle,
            version: sess.version,
            metric: sess.metric,
            bytes_in: sess.bytes_in,
            bytes_out: sess.bytes_out,
            time_of_last_in: sess.time_of_last_in,
            time_of_last_out: sess.time_of_last_out,
            duplicates: replay.duplicates,
            lost_packets: replay.lost_packets,
            received_out_of_range: replay.received_out_of_range,
        })
    }
}
