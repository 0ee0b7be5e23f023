//! weft: session layer for a self-certifying mesh overlay.
//!
//! Every node in the overlay is addressed by a 16-byte `fc00::/8` address
//! derived from its 32-byte public key. This crate implements the session
//! manager that sits between the encrypted switch fabric and the plaintext
//! inside interface: per-peer cipher sessions, the address ⇄ handle table,
//! outbound buffering during route resolution, failed-decrypt error
//! replies, the pathfinder event bus, and the periodic housekeeper.

pub mod cipher;
pub mod config;
pub mod event;
pub mod identity;
pub mod manager;
pub mod metric;
pub mod wire;

// Re-export identity types
pub use identity::{format_address, Identity, IdentityError, Ip6, PublicKey, ADDRESS_PREFIX};

// Re-export cipher types
pub use cipher::{CipherSession, DecryptError, EncryptError, ReplayStats, SessionState};

// Re-export wire types
pub use wire::{ControlError, DataHeader, RouteHeader, SwitchHeader};

// Re-export event-bus types
pub use event::{CoreEvent, NodeRecord, PathfinderEvent, BROADCAST};

// Re-export config types
pub use config::{ConfigError, SessionConfig};

// Re-export the session manager
pub use manager::{
    frame_channel, FrameRx, FrameTx, HandlePage, SessionManager, SessionStats,
    HOUSEKEEPING_INTERVAL_MS,
};
