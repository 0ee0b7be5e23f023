//! Outbound messages parked while a route is being resolved.
//!
//! At most one message waits per destination — a newer submission evicts
//! the older one — and nothing waits longer than ten seconds. When the
//! store is full, a sweep runs before the new message is rejected.

use std::collections::HashMap;

use tracing::debug;

use crate::identity::Ip6;

/// How long a message may wait for route resolution.
pub const BUFFER_TIMEOUT_MS: u64 = 10_000;

pub(crate) struct BufferedMessage {
    pub(crate) frame: Vec<u8>,
    pub(crate) time_sent_ms: u64,
}

pub(crate) struct BufferedMessages {
    map: HashMap<Ip6, BufferedMessage>,
    max: usize,
}

impl BufferedMessages {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            map: HashMap::new(),
            max,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn contains(&self, ip: &Ip6) -> bool {
        self.map.contains_key(ip)
    }

    pub(crate) fn take(&mut self, ip: &Ip6) -> Option<BufferedMessage> {
        self.map.remove(ip)
    }

    /// Park `frame` for `ip`. Returns false when the store stayed full even
    /// after sweeping and the frame was dropped.
    pub(crate) fn insert(&mut self, ip: Ip6, frame: Vec<u8>, now_ms: u64) -> bool {
        if self.map.remove(&ip).is_some() {
            debug!(ip = %ip, "DROP buffered message superseded by a newer one");
        }
        if self.map.len() >= self.max {
            self.sweep(now_ms);
            if self.map.len() >= self.max {
                debug!(ip = %ip, max = self.max, "DROP message needing lookup, buffer is full");
                return false;
            }
        }
        self.map.insert(
            ip,
            BufferedMessage {
                frame,
                time_sent_ms: now_ms,
            },
        );
        true
    }

    /// Drop every entry that has waited past [`BUFFER_TIMEOUT_MS`].
    pub(crate) fn sweep(&mut self, now_ms: u64) {
        self.map.retain(|ip, buffered| {
            let keep = now_ms.saturating_sub(buffered.time_sent_ms) < BUFFER_TIMEOUT_MS;
            if !keep {
                debug!(ip = %ip, "DROP buffered message, route resolution timed out");
            }
            keep
        });
    }
}
