//! Node identity for the mesh overlay.
//!
//! Every node is addressed by a 16-byte IPv6-shaped address derived from its
//! 32-byte x25519 public key: the address is the truncated double SHA-512 of
//! the key and is only usable when the digest begins with the overlay prefix
//! `0xFC`. The address is therefore self-certifying — holding a key proves
//! ownership of the address, and a key that does not hash into the `fc00::/8`
//! range has no address at all.

use std::fmt;
use std::net::Ipv6Addr;

use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use thiserror::Error;
use x25519_dalek::{PublicKey as XPublic, StaticSecret};

/// First byte of every valid overlay address.
pub const ADDRESS_PREFIX: u8 = 0xfc;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid public key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid address length: expected 16, got {0}")]
    InvalidAddressLength(usize),

    #[error("invalid address prefix: expected 0xfc, got 0x{0:02x}")]
    InvalidAddressPrefix(u8),

    #[error("public key does not hash into the fc00::/8 range")]
    KeyHasNoAddress,
}

/// 32-byte x25519 public key.
///
/// An all-zero key is the "unknown peer" placeholder used while a session is
/// still waiting to learn its counterpart's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// The all-zero placeholder key.
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Create a key from a 32-byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        if slice.len() != 32 {
            return Err(IdentityError::InvalidKeyLength(slice.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero placeholder.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Default for PublicKey {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<PublicKey> for XPublic {
    fn from(key: PublicKey) -> Self {
        XPublic::from(key.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 16-byte overlay address in the `fc00::/8` range.
///
/// Constructing an `Ip6` validates the prefix, so any value of this type is
/// a well-formed overlay address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ip6([u8; 16]);

impl Ip6 {
    /// Create an address from a 16-byte array.
    pub fn from_bytes(bytes: [u8; 16]) -> Result<Self, IdentityError> {
        if bytes[0] != ADDRESS_PREFIX {
            return Err(IdentityError::InvalidAddressPrefix(bytes[0]));
        }
        Ok(Self(bytes))
    }

    /// Create an address from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        if slice.len() != 16 {
            return Err(IdentityError::InvalidAddressLength(slice.len()));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(slice);
        Self::from_bytes(bytes)
    }

    /// Derive the address for a public key.
    ///
    /// Returns `None` when the key's digest does not begin with `0xFC` —
    /// such keys simply have no address in the overlay.
    pub fn for_public_key(key: &PublicKey) -> Option<Self> {
        let first = Sha512::digest(key.as_bytes());
        let second = Sha512::digest(first);
        if second[0] != ADDRESS_PREFIX {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&second[..16]);
        Some(Self(bytes))
    }

    /// Whether a raw 16-byte value would be a valid overlay address.
    pub fn is_valid(bytes: &[u8; 16]) -> bool {
        bytes[0] == ADDRESS_PREFIX
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert to `std::net::Ipv6Addr`.
    pub fn to_ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }
}

impl fmt::Debug for Ip6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ip6({})", self.to_ipv6())
    }
}

impl fmt::Display for Ip6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ipv6())
    }
}

/// A local keypair whose public key hashes to a valid overlay address.
#[derive(Clone)]
pub struct Identity {
    secret: [u8; 32],
    public: PublicKey,
    addr: Ip6,
}

impl Identity {
    /// Generate a fresh identity.
    ///
    /// Roughly one key in 256 hashes into `fc00::/8`, so generation loops
    /// until it finds one.
    pub fn generate() -> Self {
        loop {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from_bytes(*XPublic::from(&secret).as_bytes());
            if let Some(addr) = Ip6::for_public_key(&public) {
                return Self {
                    secret: secret.to_bytes(),
                    public,
                    addr,
                };
            }
        }
    }

    /// Reconstruct an identity from a stored secret key.
    pub fn from_secret(secret: [u8; 32]) -> Result<Self, IdentityError> {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from_bytes(*XPublic::from(&secret).as_bytes());
        let addr = Ip6::for_public_key(&public).ok_or(IdentityError::KeyHasNoAddress)?;
        Ok(Self {
            secret: secret.to_bytes(),
            public,
            addr,
        })
    }

    /// This identity's public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// This identity's overlay address.
    pub fn addr(&self) -> &Ip6 {
        &self.addr
    }

    /// The raw secret key bytes, for persisting an identity.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// ECDH against a peer public key.
    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> [u8; 32] {
        let secret = StaticSecret::from(self.secret);
        *secret.diffie_hellman(&XPublic::from(*peer)).as_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Printable form of a peer address: version, path, and key.
///
/// `v20.0000.0000.0000.0013.<64 hex digits>k`
pub fn format_address(version: u32, label: u64, key: &PublicKey) -> String {
    format!(
        "v{}.{:04x}.{:04x}.{:04x}.{:04x}.{}k",
        version,
        (label >> 48) & 0xffff,
        (label >> 32) & 0xffff,
        (label >> 16) & 0xffff,
        label & 0xffff,
        hex::encode(key.as_bytes()),
    )
}
