//! Per-peer session record.

use crate::cipher::{CipherSession, SessionState};
use crate::identity::Ip6;

/// State kept for one peer: the cipher session plus path, handle, and
/// activity bookkeeping.
///
/// `receive_handle` is assigned by the table at insertion; `send_handle`
/// stays zero until the peer reveals its own handle during the handshake.
pub(crate) struct Session {
    /// The peer's overlay address (the table key).
    pub(crate) addr: Ip6,
    /// Owned authenticated-encryption session.
    pub(crate) cipher: CipherSession,
    /// Peer protocol version (0 = unknown).
    pub(crate) version: u32,
    /// Forward-direction label toward the peer (0 = unknown).
    pub(crate) send_switch_label: u64,
    /// Return-direction label the peer's frames arrive on (0 = unknown).
    pub(crate) recv_switch_label: u64,
    /// Cost estimate of the current send path; lower is better.
    pub(crate) metric: u32,
    /// Handle to stamp on outbound data frames, learned from the peer.
    pub(crate) send_handle: u32,
    /// Our handle for this session; peers stamp it on inbound data frames.
    pub(crate) receive_handle: u32,
    pub(crate) bytes_in: u64,
    pub(crate) bytes_out: u64,
    /// Last authenticated non-DHT packet from the peer.
    pub(crate) time_of_last_in: u64,
    /// Last non-DHT packet sent to the peer.
    pub(crate) time_of_last_out: u64,
    /// Last authenticated packet of any kind from the peer; drives timeout.
    pub(crate) time_of_keep_alive_in: u64,
    /// When the housekeeper last triggered a search for this peer.
    pub(crate) last_search_time: u64,
    /// Whether this manager keeps the session alive (searches, re-handshake)
    /// or an external owner does.
    pub(crate) maintain_session: bool,
    /// Set once the peer key is known and verified against `addr`.
    pub(crate) found_key: bool,
}

impl Session {
    pub(crate) fn new(
        addr: Ip6,
        cipher: CipherSession,
        version: u32,
        send_switch_label: u64,
        metric: u32,
        maintain_session: bool,
        found_key: bool,
        now_ms: u64,
    ) -> Self {
        Self {
            addr,
            cipher,
            version,
            send_switch_label,
            recv_switch_label: 0,
            metric,
            send_handle: 0,
            receive_handle: 0,
            bytes_in: 0,
            bytes_out: 0,
            time_of_last_in: now_ms,
            time_of_last_out: now_ms,
            time_of_keep_alive_in: now_ms,
            last_search_time: 0,
            maintain_session,
            found_key,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.cipher.state()
    }
}
