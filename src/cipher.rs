//! Authenticated-encryption session between two overlay nodes.
//!
//! Each peer pair shares one `CipherSession` per side, driving a small
//! handshake state machine before settling into a symmetric data phase:
//!
//! ```text
//!   initiator                       responder
//!      | -- hello (stage 0/1) -------> |     ReceivedHello
//!      | <------- key (stage 2/3) --   |     SentKey
//!   ReceivedKey                        |
//!      | -- data (nonce >= 4) -------> |     Established
//!      | <------------ data (>= 4) --  |
//!   Established                        |
//! ```
//!
//! Handshake packets carry a 92-byte header in the clear:
//!
//! ```text
//! [stage:4 BE][salt:24][sender_static:32][sender_ephemeral:32][ciphertext+tag]
//! ```
//!
//! Data packets carry only the 4-byte big-endian nonce (values 0–3 are
//! reserved for handshake stages) followed by the ciphertext. Payload keys
//! come from HKDF-SHA256 over x25519 shared secrets; the data phase uses a
//! 64-entry sliding replay window whose drop counters feed the admin view.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use x25519_dalek::{PublicKey as XPublic, StaticSecret};

use crate::identity::{Identity, Ip6, PublicKey};

/// Handshake stage words (the reserved low nonce values).
pub const STAGE_HELLO: u32 = 0;
pub const STAGE_REPEAT_HELLO: u32 = 1;
pub const STAGE_KEY: u32 = 2;
pub const STAGE_REPEAT_KEY: u32 = 3;

/// First nonce usable by a data-phase packet.
pub const FIRST_DATA_NONCE: u32 = 4;

/// Random salt carried by every handshake packet; its first 12 bytes are
/// the AEAD nonce, so repeats of the same stage never reuse one.
pub const SALT_SIZE: usize = 24;

/// AEAD tag size.
pub const TAG_SIZE: usize = 16;

/// Cleartext handshake header: stage + salt + static key + ephemeral key.
pub const CRYPTO_HEADER_SIZE: usize = 4 + SALT_SIZE + 32 + 32;

/// An unfinished handshake idle longer than this is torn back to `Init`.
const SETUP_RESET_AFTER_MS: u64 = 60_000;

const HELLO_SALT: &[u8] = b"weft/hello/v1";
const KEY_SALT: &[u8] = b"weft/key/v1";
const DATA_SALT: &[u8] = b"weft/data/v1";

/// Handshake/data-phase progress, ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Nothing sent or received yet.
    Init,
    /// We initiated and are waiting for the peer's key packet.
    SentHello,
    /// We received a hello and owe the peer a key packet.
    ReceivedHello,
    /// We answered a hello; waiting for the first data packet.
    SentKey,
    /// We hold the peer's key material; data may flow.
    ReceivedKey,
    /// Both directions have carried authenticated data.
    Established,
}

impl SessionState {
    /// Stable numeric code, used in failed-decrypt error envelopes.
    pub fn code(self) -> u32 {
        match self {
            SessionState::Init => 0,
            SessionState::SentHello => 1,
            SessionState::ReceivedHello => 2,
            SessionState::SentKey => 3,
            SessionState::ReceivedKey => 4,
            SessionState::Established => 5,
        }
    }

    /// Whether non-handshake traffic may be sent.
    pub fn is_ready_for_data(self) -> bool {
        self >= SessionState::ReceivedKey
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::SentHello => "sent_hello",
            SessionState::ReceivedHello => "received_hello",
            SessionState::SentKey => "sent_key",
            SessionState::ReceivedKey => "received_key",
            SessionState::Established => "established",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Errors from the decrypt path.
///
/// Codes are stable: they travel inside authentication-error control frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error("packet too short")]
    Runt,

    #[error("data packet before key exchange completed")]
    NoSessionKeys,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("nonce already seen or outside the replay window")]
    Replay,

    #[error("handshake static key does not match the session peer")]
    WrongKey,

    #[error("handshake packet out of order for this session state")]
    StateMismatch,
}

impl DecryptError {
    pub fn code(self) -> u32 {
        match self {
            DecryptError::Runt => 1,
            DecryptError::NoSessionKeys => 2,
            DecryptError::AuthenticationFailed => 3,
            DecryptError::Replay => 4,
            DecryptError::WrongKey => 5,
            DecryptError::StateMismatch => 6,
        }
    }
}

/// Errors from the encrypt path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum EncryptError {
    #[error("peer public key unknown, cannot initiate")]
    UnknownPeerKey,

    #[error("outbound nonce space exhausted")]
    NonceExhausted,
}

/// Which side of the handshake this session took.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Replay-window drop counters, surfaced through the admin view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Authentic packets whose nonce was already accepted.
    pub duplicates: u32,
    /// Nonces that fell off the window without ever arriving.
    pub lost_packets: u32,
    /// Authentic packets too far behind the window to judge.
    pub received_out_of_range: u32,
}

/// 64-entry sliding window over data-phase nonces.
///
/// Bit `i` of the bitmap tracks nonce `highest - i`.
#[derive(Debug, Default)]
struct ReplayWindow {
    highest: Option<u32>,
    bitmap: u64,
    stats: ReplayStats,
}

impl ReplayWindow {
    fn check(&mut self, nonce: u32) -> Result<(), DecryptError> {
        let highest = match self.highest {
            None => {
                self.highest = Some(nonce);
                self.bitmap = 1;
                return Ok(());
            }
            Some(h) => h,
        };

        if nonce > highest {
            let shift = nonce - highest;
            if shift >= 64 {
                self.stats.lost_packets += 64 - self.bitmap.count_ones() + (shift - 64);
                self.bitmap = 1;
            } else {
                let dropped = self.bitmap >> (64 - shift);
                self.stats.lost_packets += shift - dropped.count_ones();
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.highest = Some(nonce);
            return Ok(());
        }

        let offset = highest - nonce;
        if offset >= 64 {
            self.stats.received_out_of_range += 1;
            return Err(DecryptError::Replay);
        }
        let bit = 1u64 << offset;
        if self.bitmap & bit != 0 {
            self.stats.duplicates += 1;
            return Err(DecryptError::Replay);
        }
        self.bitmap |= bit;
        Ok(())
    }

    fn reset(&mut self) {
        self.highest = None;
        self.bitmap = 0;
        // stats survive resets: they describe the peer, not the epoch
    }
}

/// One side of an authenticated-encryption session.
pub struct CipherSession {
    local: Identity,
    her_public_key: PublicKey,
    state: SessionState,
    role: Option<Role>,
    eph_secret: [u8; 32],
    eph_public: PublicKey,
    her_eph: PublicKey,
    tx_key: [u8; 32],
    rx_key: [u8; 32],
    keys_ready: bool,
    send_nonce: u32,
    replay: ReplayWindow,
    time_of_last_packet_ms: u64,
    reset_after_ms: u64,
}

impl CipherSession {
    /// Create a session toward `her_key` (zero if not yet known).
    pub fn new(local: Identity, her_key: PublicKey, now_ms: u64) -> Self {
        let (eph_secret, eph_public) = fresh_ephemeral();
        Self {
            local,
            her_public_key: her_key,
            state: SessionState::Init,
            role: None,
            eph_secret,
            eph_public,
            her_eph: PublicKey::zero(),
            tx_key: [0u8; 32],
            rx_key: [0u8; 32],
            keys_ready: false,
            send_nonce: FIRST_DATA_NONCE,
            replay: ReplayWindow::default(),
            time_of_last_packet_ms: now_ms,
            reset_after_ms: SETUP_RESET_AFTER_MS,
        }
    }

    /// The peer's static key (zero until learned).
    pub fn her_public_key(&self) -> &PublicKey {
        &self.her_public_key
    }

    /// The peer's derived overlay address, when the key is known.
    pub fn her_addr(&self) -> Option<Ip6> {
        if self.her_public_key.is_zero() {
            return None;
        }
        Ip6::for_public_key(&self.her_public_key)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn replay_stats(&self) -> ReplayStats {
        self.replay.stats
    }

    /// Tear an unfinished handshake back to `Init` after prolonged silence,
    /// so the next outbound packet starts over with a fresh ephemeral.
    pub fn reset_if_timeout(&mut self, now_ms: u64) {
        if self.state == SessionState::Init || self.state == SessionState::Established {
            return;
        }
        if now_ms.saturating_sub(self.time_of_last_packet_ms) <= self.reset_after_ms {
            return;
        }
        debug!(state = %self.state, "cipher session reset after setup timeout");
        let (eph_secret, eph_public) = fresh_ephemeral();
        self.eph_secret = eph_secret;
        self.eph_public = eph_public;
        self.her_eph = PublicKey::zero();
        self.tx_key = [0u8; 32];
        self.rx_key = [0u8; 32];
        self.keys_ready = false;
        self.send_nonce = FIRST_DATA_NONCE;
        self.replay.reset();
        self.state = SessionState::Init;
        self.role = None;
        self.time_of_last_packet_ms = now_ms;
    }

    /// Extract the sender's static key from a cleartext handshake header.
    pub fn handshake_public_key(msg: &[u8]) -> Option<PublicKey> {
        if msg.len() < CRYPTO_HEADER_SIZE {
            return None;
        }
        let stage = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);
        if stage >= FIRST_DATA_NONCE {
            return None;
        }
        PublicKey::from_slice(&msg[28..60]).ok()
    }

    /// Encrypt one plaintext into the next packet this session owes the
    /// wire: a hello, a key packet, or a data packet, depending on state.
    pub fn encrypt(&mut self, plaintext: &[u8], _now_ms: u64) -> Result<Vec<u8>, EncryptError> {
        match self.state {
            SessionState::Init | SessionState::SentHello => {
                if self.her_public_key.is_zero() {
                    return Err(EncryptError::UnknownPeerKey);
                }
                let stage = if self.state == SessionState::Init {
                    STAGE_HELLO
                } else {
                    STAGE_REPEAT_HELLO
                };
                let ikm = self.hello_ikm_as_sender();
                let packet = self.seal_handshake(stage, &ikm, HELLO_SALT, plaintext);
                self.role = Some(Role::Initiator);
                self.state = SessionState::SentHello;
                Ok(packet)
            }
            SessionState::ReceivedHello | SessionState::SentKey => {
                let stage = if self.state == SessionState::ReceivedHello {
                    STAGE_KEY
                } else {
                    STAGE_REPEAT_KEY
                };
                let ikm = self.key_ikm_as_sender();
                let packet = self.seal_handshake(stage, &ikm, KEY_SALT, plaintext);
                if !self.keys_ready {
                    self.derive_data_keys();
                }
                self.state = SessionState::SentKey;
                Ok(packet)
            }
            SessionState::ReceivedKey | SessionState::Established => {
                let nonce = self.send_nonce;
                if nonce == u32::MAX {
                    return Err(EncryptError::NonceExhausted);
                }
                self.send_nonce += 1;
                let mut aead_nonce = [0u8; 12];
                aead_nonce[8..].copy_from_slice(&nonce.to_be_bytes());
                let ct = seal(&self.tx_key, &aead_nonce, plaintext);
                let mut packet = Vec::with_capacity(4 + ct.len());
                packet.extend_from_slice(&nonce.to_be_bytes());
                packet.extend_from_slice(&ct);
                Ok(packet)
            }
        }
    }

    /// Decrypt one packet (starting at its stage/nonce word).
    pub fn decrypt(&mut self, msg: &[u8], now_ms: u64) -> Result<Vec<u8>, DecryptError> {
        if msg.len() < 4 {
            return Err(DecryptError::Runt);
        }
        let stage = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);
        if stage >= FIRST_DATA_NONCE {
            self.decrypt_data(stage, &msg[4..], now_ms)
        } else {
            self.decrypt_handshake(stage, msg, now_ms)
        }
    }

    fn decrypt_data(
        &mut self,
        nonce: u32,
        ct: &[u8],
        now_ms: u64,
    ) -> Result<Vec<u8>, DecryptError> {
        if !self.keys_ready {
            return Err(DecryptError::NoSessionKeys);
        }
        if ct.len() < TAG_SIZE {
            return Err(DecryptError::Runt);
        }
        let mut aead_nonce = [0u8; 12];
        aead_nonce[8..].copy_from_slice(&nonce.to_be_bytes());
        let plaintext =
            open(&self.rx_key, &aead_nonce, ct).ok_or(DecryptError::AuthenticationFailed)?;
        self.replay.check(nonce)?;
        if self.state < SessionState::Established {
            self.state = SessionState::Established;
        }
        self.time_of_last_packet_ms = now_ms;
        Ok(plaintext)
    }

    fn decrypt_handshake(
        &mut self,
        stage: u32,
        msg: &[u8],
        now_ms: u64,
    ) -> Result<Vec<u8>, DecryptError> {
        if msg.len() < CRYPTO_HEADER_SIZE + TAG_SIZE {
            return Err(DecryptError::Runt);
        }
        let mut aead_nonce = [0u8; 12];
        aead_nonce.copy_from_slice(&msg[4..16]);
        let sender_static =
            PublicKey::from_slice(&msg[28..60]).map_err(|_| DecryptError::Runt)?;
        let sender_eph = PublicKey::from_slice(&msg[60..92]).map_err(|_| DecryptError::Runt)?;
        let ct = &msg[CRYPTO_HEADER_SIZE..];

        if stage <= STAGE_REPEAT_HELLO {
            if !self.her_public_key.is_zero() && self.her_public_key != sender_static {
                return Err(DecryptError::WrongKey);
            }
            // Simultaneous-hello tie-break: the side with the greater key
            // yields and becomes the responder.
            if self.state == SessionState::SentHello
                && self.local.public_key().as_bytes() <= sender_static.as_bytes()
            {
                return Err(DecryptError::StateMismatch);
            }
            let ikm = self.hello_ikm_as_receiver(&sender_static, &sender_eph);
            let plaintext = open_with_ikm(&ikm, HELLO_SALT, &aead_nonce, ct)
                .ok_or(DecryptError::AuthenticationFailed)?;
            self.her_public_key = sender_static;
            self.her_eph = sender_eph;
            self.role = Some(Role::Responder);
            if self.keys_ready {
                // Peer restarted its handshake; old epoch keys are gone.
                self.keys_ready = false;
                self.send_nonce = FIRST_DATA_NONCE;
                self.replay.reset();
            }
            self.state = SessionState::ReceivedHello;
            self.time_of_last_packet_ms = now_ms;
            return Ok(plaintext);
        }

        // Key packet: only meaningful to the initiator after its hello.
        if self.role != Some(Role::Initiator) || self.state < SessionState::SentHello {
            return Err(DecryptError::StateMismatch);
        }
        if self.her_public_key != sender_static {
            return Err(DecryptError::WrongKey);
        }
        let ikm = self.key_ikm_as_receiver(&sender_eph);
        let plaintext = open_with_ikm(&ikm, KEY_SALT, &aead_nonce, ct)
            .ok_or(DecryptError::AuthenticationFailed)?;
        if self.her_eph != sender_eph {
            self.her_eph = sender_eph;
            self.derive_data_keys();
            self.send_nonce = FIRST_DATA_NONCE;
            self.replay.reset();
        }
        if self.state < SessionState::ReceivedKey {
            self.state = SessionState::ReceivedKey;
        }
        self.time_of_last_packet_ms = now_ms;
        Ok(plaintext)
    }

    // === Key schedule ===

    fn eph_diffie_hellman(&self, peer: &PublicKey) -> [u8; 32] {
        let secret = StaticSecret::from(self.eph_secret);
        *secret.diffie_hellman(&XPublic::from(*peer)).as_bytes()
    }

    fn hello_ikm_as_sender(&self) -> [u8; 64] {
        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(&self.eph_diffie_hellman(&self.her_public_key));
        ikm[32..].copy_from_slice(&self.local.diffie_hellman(&self.her_public_key));
        ikm
    }

    fn hello_ikm_as_receiver(&self, sender_static: &PublicKey, sender_eph: &PublicKey) -> [u8; 64] {
        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(&self.local.diffie_hellman(sender_eph));
        ikm[32..].copy_from_slice(&self.local.diffie_hellman(sender_static));
        ikm
    }

    fn key_ikm_as_sender(&self) -> [u8; 64] {
        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(&self.eph_diffie_hellman(&self.her_eph));
        ikm[32..].copy_from_slice(&self.local.diffie_hellman(&self.her_eph));
        ikm
    }

    fn key_ikm_as_receiver(&self, sender_eph: &PublicKey) -> [u8; 64] {
        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(&self.eph_diffie_hellman(sender_eph));
        ikm[32..].copy_from_slice(&self.eph_diffie_hellman(&self.her_public_key));
        ikm
    }

    /// Derive the directional data-phase keys. Requires both ephemerals.
    fn derive_data_keys(&mut self) {
        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(&self.eph_diffie_hellman(&self.her_eph));
        ikm[32..].copy_from_slice(&self.local.diffie_hellman(&self.her_public_key));
        let hk = Hkdf::<Sha256>::new(Some(DATA_SALT), &ikm);
        let mut okm = [0u8; 64];
        hk.expand(b"", &mut okm)
            .expect("64 bytes is a valid HKDF output length");
        let (initiator_key, responder_key) = okm.split_at(32);
        match self.role {
            Some(Role::Initiator) => {
                self.tx_key.copy_from_slice(initiator_key);
                self.rx_key.copy_from_slice(responder_key);
            }
            _ => {
                self.tx_key.copy_from_slice(responder_key);
                self.rx_key.copy_from_slice(initiator_key);
            }
        }
        self.keys_ready = true;
    }

    fn seal_handshake(&self, stage: u32, ikm: &[u8; 64], salt: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut packet_salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill(&mut packet_salt[..]);
        let mut aead_nonce = [0u8; 12];
        aead_nonce.copy_from_slice(&packet_salt[..12]);
        let key = expand_key(ikm, salt);
        let ct = seal(&key, &aead_nonce, plaintext);

        let mut packet = Vec::with_capacity(CRYPTO_HEADER_SIZE + ct.len());
        packet.extend_from_slice(&stage.to_be_bytes());
        packet.extend_from_slice(&packet_salt);
        packet.extend_from_slice(self.local.public_key().as_bytes());
        packet.extend_from_slice(self.eph_public.as_bytes());
        packet.extend_from_slice(&ct);
        packet
    }
}

impl std::fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSession")
            .field("state", &self.state)
            .field("her_public_key", &self.her_public_key)
            .field("keys_ready", &self.keys_ready)
            .finish_non_exhaustive()
    }
}

fn fresh_ephemeral() -> ([u8; 32], PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from_bytes(*XPublic::from(&secret).as_bytes());
    (secret.to_bytes(), public)
}

fn expand_key(ikm: &[u8; 64], salt: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(b"", &mut okm)
        .expect("32 bytes is a valid HKDF output length");
    okm
}

fn open_with_ikm(ikm: &[u8; 64], salt: &[u8], nonce: &[u8; 12], ct: &[u8]) -> Option<Vec<u8>> {
    open(&expand_key(ikm, salt), nonce, ct)
}

fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("32-byte AEAD key");
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .expect("chacha20poly1305 encryption is infallible for in-memory buffers")
}

fn open(key: &[u8; 32], nonce: &[u8; 12], ct: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("32-byte AEAD key");
    cipher.decrypt(Nonce::from_slice(nonce), ct).ok()
}
