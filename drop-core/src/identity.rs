//! Device identity: X25519 keypairs exchanged during the session handshake, device IDs.

use std::fmt;

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

pub const PUBLIC_KEY_LEN: usize = 32;

/// Device public key (32 bytes, X25519). Carried in handshake frames.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Parse a handshake payload. `None` unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(PublicKey)
    }
}

/// Device ID: deterministic hash of public key. Default advertised uid.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    /// Derive device ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &[u8; PUBLIC_KEY_LEN]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        DeviceId(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and device ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    device_id: DeviceId,
}

impl Keypair {
    /// Generate a new random keypair and derive device ID from public key.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let device_id = DeviceId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            device_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Shared secret with a peer's public key. Both sides of a handshake agree on it.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Short, human-comparable fingerprint of a handshake: SHA-256 over both public keys
/// and the shared secret, ordered so both peers compute the same value.
pub fn session_fingerprint(local: &Keypair, remote: &PublicKey) -> String {
    let (a, b) = if local.public_key().as_bytes() <= remote.as_bytes() {
        (local.public_key(), remote)
    } else {
        (remote, local.public_key())
    };
    let mut hasher = Sha256::new();
    hasher.update(b"drop-session-v1");
    hasher.update(a.as_bytes());
    hasher.update(b.as_bytes());
    hasher.update(local.shared_secret(remote));
    hasher.finalize()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_device_id_derivation() {
        let kp = Keypair::generate();
        let id = DeviceId::from_public_key(kp.public_key().as_bytes());
        assert_eq!(id, kp.device_id());
        assert_eq!(kp.device_id().to_string().len(), 32);
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let secret_a = a.shared_secret(b.public_key());
        let secret_b = b.shared_secret(a.public_key());
        assert_eq!(secret_a, secret_b);
        assert_eq!(
            session_fingerprint(&a, b.public_key()),
            session_fingerprint(&b, a.public_key())
        );
    }

    #[test]
    fn secret_bytes_restore_same_identity() {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let a = Keypair::from_secret_bytes(secret);
        let b = Keypair::from_secret_bytes(secret);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn public_key_from_slice_checks_length() {
        assert!(PublicKey::from_slice(&[1u8; 32]).is_some());
        assert!(PublicKey::from_slice(&[1u8; 31]).is_none());
        assert!(PublicKey::from_slice(b"OK").is_none());
    }
}
