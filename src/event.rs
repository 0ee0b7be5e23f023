//! Event-bus frames exchanged with pathfinders.
//!
//! Every frame is `[event:4 BE][pathfinder_id:4 BE][payload]`. On frames the
//! session manager emits, the id addresses a destination pathfinder
//! (`0xFFFFFFFF` broadcasts); on frames it receives, the id names the source
//! pathfinder so request/response pairs correlate without callbacks.
//!
//! Node-bearing payloads use the fixed 64-byte record:
//!
//! ```text
//! [path:8 BE][metric:4 BE][version:4 BE][public_key:32][ip6:16]
//! ```

use crate::identity::{Ip6, PublicKey};

/// Destination id that addresses every attached pathfinder.
pub const BROADCAST: u32 = 0xffff_ffff;

/// Size of the serialized [`NodeRecord`].
pub const NODE_RECORD_SIZE: usize = 64;

/// Size of a `SearchReq` payload: target address, pad word, version.
pub const SEARCH_PAYLOAD_SIZE: usize = 24;

/// Events emitted by the session manager toward pathfinders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CoreEvent {
    /// A session exists (emitted on creation and on enumeration requests).
    Session = 512,
    /// A session timed out and was removed.
    SessionEnded = 513,
    /// An incoming frame revealed a new return path.
    DiscoveredPath = 514,
    /// A session is stuck below the key-received state.
    UnsetupSession = 515,
    /// A route to the given address is needed.
    SearchReq = 516,
}

impl CoreEvent {
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            512 => Some(CoreEvent::Session),
            513 => Some(CoreEvent::SessionEnded),
            514 => Some(CoreEvent::DiscoveredPath),
            515 => Some(CoreEvent::UnsetupSession),
            516 => Some(CoreEvent::SearchReq),
            _ => None,
        }
    }
}

/// Events the session manager consumes from pathfinders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PathfinderEvent {
    /// A node discovery: `[NodeRecord]`.
    Node = 1,
    /// Request to re-announce every live session to the sender.
    Sessions = 2,
}

impl PathfinderEvent {
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(PathfinderEvent::Node),
            2 => Some(PathfinderEvent::Sessions),
            _ => None,
        }
    }
}

/// The 64-byte node record carried by node-bearing events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub path: u64,
    pub metric: u32,
    pub version: u32,
    pub public_key: PublicKey,
    pub ip6: [u8; 16],
}

impl NodeRecord {
    pub fn encode(&self) -> [u8; NODE_RECORD_SIZE] {
        let mut out = [0u8; NODE_RECORD_SIZE];
        out[..8].copy_from_slice(&self.path.to_be_bytes());
        out[8..12].copy_from_slice(&self.metric.to_be_bytes());
        out[12..16].copy_from_slice(&self.version.to_be_bytes());
        out[16..48].copy_from_slice(self.public_key.as_bytes());
        out[48..64].copy_from_slice(&self.ip6);
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < NODE_RECORD_SIZE {
            return None;
        }
        let mut path = [0u8; 8];
        path.copy_from_slice(&data[..8]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&data[16..48]);
        let mut ip6 = [0u8; 16];
        ip6.copy_from_slice(&data[48..64]);
        Some(Self {
            path: u64::from_be_bytes(path),
            metric: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            version: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            public_key: PublicKey::from_bytes(key),
            ip6,
        })
    }
}

/// Assemble an event frame.
pub fn build_frame(tag: u32, pathfinder_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&tag.to_be_bytes());
    frame.extend_from_slice(&pathfinder_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split an event frame into `(tag, pathfinder_id, payload)`.
pub fn parse_frame(frame: &[u8]) -> Option<(u32, u32, &[u8])> {
    if frame.len() < 8 {
        return None;
    }
    let tag = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let id = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    Some((tag, id, &frame[8..]))
}

/// Payload of a `SearchReq`: the target address and protocol version.
pub fn search_payload(target: &Ip6, version: u32) -> [u8; SEARCH_PAYLOAD_SIZE] {
    let mut out = [0u8; SEARCH_PAYLOAD_SIZE];
    out[..16].copy_from_slice(target.as_bytes());
    out[20..24].copy_from_slice(&version.to_be_bytes());
    out
}
