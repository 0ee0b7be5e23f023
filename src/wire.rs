//! Wire formats shared by the switch-facing and inside-facing interfaces.
//!
//! All multi-byte fields are big endian.
//!
//! ## Switch header (12 bytes)
//!
//! ```text
//! [label:8][congest+suppress:1][version+shift:1][traffic_class:2]
//! ```
//!
//! The routing fabric delivers labels bit-reversed; the forward-direction
//! label is their bit-reversal. Bit 0 of the congestion byte is the
//! suppress-errors flag.
//!
//! ## Route header (68 bytes, inside interface)
//!
//! ```text
//! [switch_header:12][public_key:32][version:4][flags:1][pad:3][ip6:16]
//! ```
//!
//! ## Data header (4 bytes)
//!
//! ```text
//! [version+flags:1][unused:1][content_type:2]
//! ```
//!
//! ## Control frames
//!
//! A `0xFFFFFFFF` word after the switch header marks a control frame. The
//! only control frame built here is the failed-decrypt error reply:
//!
//! ```text
//! [switch_header:12][0xFFFFFFFF][csum:2][type=ERROR:2][code=AUTHENTICATION:4]
//! [original first 16 bytes][decrypt_error:4][session_state:4]
//! ```

use crate::identity::PublicKey;

/// Size of the switch header.
pub const SWITCH_HEADER_SIZE: usize = 12;

/// Size of the route header.
pub const ROUTE_HEADER_SIZE: usize = 68;

/// Size of the data header.
pub const DATA_HEADER_SIZE: usize = 4;

/// Current switch header version (top two bits of byte 9).
pub const SWITCH_CURRENT_VERSION: u8 = 1;

/// Current data header version (top four bits of byte 0).
pub const DATA_CURRENT_VERSION: u8 = 1;

/// Marker word identifying a control frame on the switch interface.
pub const CTRL_MARKER: u32 = 0xffff_ffff;

/// Control frame type: error report.
pub const CTRL_ERROR: u16 = 2;

/// Error code: decryption/authentication failure.
pub const ERROR_AUTHENTICATION: u32 = 6;

/// Route header flag: frame travels from the switch toward the inside.
pub const FLAG_INCOMING: u8 = 0x01;

/// Route header flag: frame is a control message, not session data.
pub const FLAG_CTRLMSG: u8 = 0x02;

/// Route header flag: frame originates from a pathfinder.
pub const FLAG_PATHFINDER: u8 = 0x04;

/// Content type of the routing/DHT channel.
///
/// DHT traffic is exempt from the forward-secrecy hold-back: it may be sent
/// before the cipher session has received the peer's key.
pub const CONTENT_DHT: u16 = 256;

/// Content type of plain tunneled IPv6 traffic.
pub const CONTENT_IP6: u16 = 0;

/// The fabric delivers labels bit-reversed relative to the forward path.
pub fn reverse_label(label: u64) -> u64 {
    label.reverse_bits()
}

/// Parsed switch header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchHeader {
    /// Hop-by-hop routing label.
    pub label: u64,
    /// Congestion estimate (7 bits).
    pub congestion: u8,
    /// Do not reply to this frame with an error frame.
    pub suppress_errors: bool,
    /// Header version.
    pub version: u8,
    /// How many label bits have been consumed along the path.
    pub label_shift: u8,
    /// Traffic class / QoS hint.
    pub traffic_class: u16,
}

impl SwitchHeader {
    /// Parse from the first 12 bytes of a frame.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SWITCH_HEADER_SIZE {
            return None;
        }
        let mut label_bytes = [0u8; 8];
        label_bytes.copy_from_slice(&data[..8]);
        Some(Self {
            label: u64::from_be_bytes(label_bytes),
            congestion: data[8] >> 1,
            suppress_errors: data[8] & 0x01 != 0,
            version: data[9] >> 6,
            label_shift: data[9] & 0x3f,
            traffic_class: u16::from_be_bytes([data[10], data[11]]),
        })
    }

    /// Encode to wire form.
    pub fn encode(&self) -> [u8; SWITCH_HEADER_SIZE] {
        let mut out = [0u8; SWITCH_HEADER_SIZE];
        out[..8].copy_from_slice(&self.label.to_be_bytes());
        out[8] = (self.congestion << 1) | u8::from(self.suppress_errors);
        out[9] = (self.version << 6) | (self.label_shift & 0x3f);
        out[10..12].copy_from_slice(&self.traffic_class.to_be_bytes());
        out
    }

    /// A fresh header for `label` at the current version.
    pub fn for_label(label: u64) -> Self {
        Self {
            label,
            version: SWITCH_CURRENT_VERSION,
            ..Self::default()
        }
    }
}

/// Parsed route header.
///
/// `ip6` stays raw bytes: an all-zero destination is legal on control
/// frames, so the field cannot be a validated address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteHeader {
    pub switch: SwitchHeader,
    pub public_key: PublicKey,
    pub version: u32,
    pub flags: u8,
    pub ip6: [u8; 16],
}

impl RouteHeader {
    /// Parse from the first 68 bytes of an inside frame.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ROUTE_HEADER_SIZE {
            return None;
        }
        let switch = SwitchHeader::parse(&data[..SWITCH_HEADER_SIZE])?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&data[12..44]);
        let version = u32::from_be_bytes([data[44], data[45], data[46], data[47]]);
        let flags = data[48];
        let mut ip6 = [0u8; 16];
        ip6.copy_from_slice(&data[52..68]);
        Some(Self {
            switch,
            public_key: PublicKey::from_bytes(key),
            version,
            flags,
            ip6,
        })
    }

    /// Encode to wire form.
    pub fn encode(&self) -> [u8; ROUTE_HEADER_SIZE] {
        let mut out = [0u8; ROUTE_HEADER_SIZE];
        out[..12].copy_from_slice(&self.switch.encode());
        out[12..44].copy_from_slice(self.public_key.as_bytes());
        out[44..48].copy_from_slice(&self.version.to_be_bytes());
        out[48] = self.flags;
        out[52..68].copy_from_slice(&self.ip6);
        out
    }

    /// Whether the destination key field is all zero.
    pub fn has_zero_key(&self) -> bool {
        self.public_key.is_zero()
    }

    /// Whether the destination address field is all zero.
    pub fn has_zero_ip6(&self) -> bool {
        self.ip6.iter().all(|b| *b == 0)
    }
}

/// Parsed data header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub version: u8,
    pub content_type: u16,
}

impl DataHeader {
    /// Parse from the first 4 bytes of a plaintext payload.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < DATA_HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: data[0] >> 4,
            content_type: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Encode to wire form.
    pub fn encode(&self) -> [u8; DATA_HEADER_SIZE] {
        let mut out = [0u8; DATA_HEADER_SIZE];
        out[0] = self.version << 4;
        out[2..4].copy_from_slice(&self.content_type.to_be_bytes());
        out
    }

    /// A current-version header for `content_type`.
    pub fn for_content(content_type: u16) -> Self {
        Self {
            version: DATA_CURRENT_VERSION,
            content_type,
        }
    }
}

/// Ones'-complement internet checksum.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build the control reply for a frame that failed decryption.
///
/// `label` must be the bit-reversal of the label the frame arrived with:
/// that is the return path toward the sender. The suppress-errors flag
/// prevents two nodes from bouncing authentication errors at each other
/// indefinitely.
pub fn build_auth_error_frame(
    label: u64,
    first_sixteen: &[u8; 16],
    decrypt_error: u32,
    session_state: u32,
) -> Vec<u8> {
    let mut ctrl = Vec::with_capacity(32);
    ctrl.extend_from_slice(&[0u8; 2]); // checksum placeholder
    ctrl.extend_from_slice(&CTRL_ERROR.to_be_bytes());
    ctrl.extend_from_slice(&ERROR_AUTHENTICATION.to_be_bytes());
    ctrl.extend_from_slice(first_sixteen);
    ctrl.extend_from_slice(&decrypt_error.to_be_bytes());
    ctrl.extend_from_slice(&session_state.to_be_bytes());
    let csum = internet_checksum(&ctrl);
    ctrl[..2].copy_from_slice(&csum.to_be_bytes());

    let mut sh = SwitchHeader::for_label(label);
    sh.suppress_errors = true;

    let mut frame = Vec::with_capacity(SWITCH_HEADER_SIZE + 4 + ctrl.len());
    frame.extend_from_slice(&sh.encode());
    frame.extend_from_slice(&CTRL_MARKER.to_be_bytes());
    frame.extend_from_slice(&ctrl);
    frame
}

/// Parsed failed-decrypt control reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlError {
    pub error_code: u32,
    pub first_sixteen: [u8; 16],
    pub decrypt_error: u32,
    pub session_state: u32,
}

impl ControlError {
    /// Parse the control portion of a frame (the bytes after the
    /// `0xFFFFFFFF` marker). Verifies the checksum and the ERROR type.
    pub fn parse(ctrl: &[u8]) -> Option<Self> {
        if ctrl.len() < 32 {
            return None;
        }
        let mut copy = ctrl.to_vec();
        copy[0] = 0;
        copy[1] = 0;
        let expected = internet_checksum(&copy);
        if u16::from_be_bytes([ctrl[0], ctrl[1]]) != expected {
            return None;
        }
        if u16::from_be_bytes([ctrl[2], ctrl[3]]) != CTRL_ERROR {
            return None;
        }
        let error_code = u32::from_be_bytes([ctrl[4], ctrl[5], ctrl[6], ctrl[7]]);
        let mut first_sixteen = [0u8; 16];
        first_sixteen.copy_from_slice(&ctrl[8..24]);
        let decrypt_error = u32::from_be_bytes([ctrl[24], ctrl[25], ctrl[26], ctrl[27]]);
        let session_state = u32::from_be_bytes([ctrl[28], ctrl[29], ctrl[30], ctrl[31]]);
        Some(Self {
            error_code,
            first_sixteen,
            decrypt_error,
            session_state,
        })
    }
}
