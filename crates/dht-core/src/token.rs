//! Announce tokens: short-lived, 20-byte SHA-1 authenticators tying an
//! `announce_peer` to the address that received its token from
//! `get_peers`.
//!
//! Two secrets are live at any time: `secret` mints new tokens,
//! `old_secret` is still accepted for validation, covering the window
//! right after a rotation.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

use crate::SECRET_ROTATION_SECS;

pub const TOKEN_BYTES: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Token(pub [u8; TOKEN_BYTES]);

/// Holds the current and previous 20-byte secrets and rotates them on a
/// timer. Keeping the previous secret alive lets a token minted just
/// before rotation still validate against an announce_peer that arrives
/// just after.
pub struct SecretManager {
    secret: [u8; TOKEN_BYTES],
    old_secret: [u8; TOKEN_BYTES],
    last_rotation: Instant,
}

impl SecretManager {
    pub fn new() -> Self {
        SecretManager {
            secret: random_secret(),
            old_secret: random_secret(),
            last_rotation: Instant::now(),
        }
    }

    /// Rotate if more than [`SECRET_ROTATION_SECS`] have elapsed since
    /// the last rotation. Returns true if it rotated.
    pub fn maybe_rotate(&mut self) -> bool {
        if self.last_rotation.elapsed() >= Duration::from_secs(SECRET_ROTATION_SECS) {
            self.old_secret = self.secret;
            self.secret = random_secret();
            self.last_rotation = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn mint(&self, ip: IpAddr, port: u16) -> Token {
        mint_with(ip, port, &self.secret)
    }

    pub fn is_valid(&self, token: &Token, ip: IpAddr, port: u16) -> bool {
        token == &mint_with(ip, port, &self.secret) || token == &mint_with(ip, port, &self.old_secret)
    }
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; TOKEN_BYTES] {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    bytes
}

/// `SHA1(ip_bytes || port_be || secret)`. Raw address bytes rather than
/// a textual join: both `mint` and `verify` agree on this encoding,
/// which is all that's required for tokens to round-trip correctly.
fn mint_with(ip: IpAddr, port: u16, secret: &[u8; TOKEN_BYTES]) -> Token {
    let mut hasher = Sha1::new();
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.update(port.to_be_bytes());
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut out = [0u8; TOKEN_BYTES];
    out.copy_from_slice(&digest);
    Token(out)
}
