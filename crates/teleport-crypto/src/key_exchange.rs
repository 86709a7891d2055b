//! Ephemeral ECDH key exchange on P-256
//!
//! Each control handshake generates a fresh key pair. Public keys travel as hex of the
//! uncompressed SEC1 point (`0x04 || X || Y`, 65 bytes). The shared secret is the
//! 32-byte x-coordinate of the agreed point and the session key is its SHA-256 digest,
//! which is exactly the AES-256 key size.

use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an uncompressed P-256 point
pub const PUBLIC_KEY_LEN: usize = 65;

const UNCOMPRESSED_POINT_TAG: u8 = 0x04;

/// Key exchange errors
#[derive(Debug, Error)]
pub enum KeyExchangeError {
    #[error("Peer public key is missing")]
    MissingPeerKey,

    #[error("Peer public key is invalid: {0}")]
    InvalidPeerKey(String),

    #[error("Failed to generate ephemeral key pair")]
    KeyGeneration,
}

/// Symmetric key derived from the ECDH shared secret
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Hash the raw shared secret into a session key
    pub fn from_shared_secret(shared_secret: &[u8]) -> Self {
        Self(Sha256::digest(shared_secret).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// One side's ephemeral key pair for a single handshake
///
/// Deriving consumes the pair, so the private scalar cannot outlive the handshake.
pub struct EphemeralKeyPair {
    private_key: EphemeralPrivateKey,
    public_key: agreement::PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Result<Self, KeyExchangeError> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
            .map_err(|_| KeyExchangeError::KeyGeneration)?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| KeyExchangeError::KeyGeneration)?;

        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        self.public_key.as_ref()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.as_ref())
    }

    /// Derive the session key from the peer's hex-encoded public key.
    pub fn derive_from_hex(
        self,
        peer_key_hex: Option<&str>,
    ) -> Result<SessionKey, KeyExchangeError> {
        let peer_key_hex = peer_key_hex
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(KeyExchangeError::MissingPeerKey)?;
        let peer_key = hex::decode(peer_key_hex)
            .map_err(|e| KeyExchangeError::InvalidPeerKey(format!("not hex: {}", e)))?;

        self.derive(&peer_key)
    }

    /// Derive the session key from the peer's uncompressed public point.
    pub fn derive(self, peer_key: &[u8]) -> Result<SessionKey, KeyExchangeError> {
        validate_encoding(peer_key)?;

        // ring rejects points that are not on the curve, including the identity.
        let peer_key = UnparsedPublicKey::new(&ECDH_P256, peer_key);
        agreement::agree_ephemeral(self.private_key, &peer_key, SessionKey::from_shared_secret)
            .map_err(|_| KeyExchangeError::InvalidPeerKey("point is not on P-256".to_string()))
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

fn validate_encoding(peer_key: &[u8]) -> Result<(), KeyExchangeError> {
    if peer_key.len() != PUBLIC_KEY_LEN {
        return Err(KeyExchangeError::InvalidPeerKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_LEN,
            peer_key.len()
        )));
    }
    if peer_key[0] != UNCOMPRESSED_POINT_TAG {
        return Err(KeyExchangeError::InvalidPeerKey(
            "not an uncompressed point".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_key() {
        for _ in 0..16 {
            let server = EphemeralKeyPair::generate().unwrap();
            let client = EphemeralKeyPair::generate().unwrap();
            let server_pub = server.public_key_hex();
            let client_pub = client.public_key_hex();

            let server_key = server.derive_from_hex(Some(&client_pub)).unwrap();
            let client_key = client.derive_from_hex(Some(&server_pub)).unwrap();

            assert_eq!(server_key.as_bytes(), client_key.as_bytes());
        }
    }

    #[test]
    fn test_public_key_is_uncompressed_point() {
        let pair = EphemeralKeyPair::generate().unwrap();
        assert_eq!(pair.public_key_bytes().len(), PUBLIC_KEY_LEN);
        assert_eq!(pair.public_key_bytes()[0], 0x04);
        assert_eq!(pair.public_key_hex().len(), PUBLIC_KEY_LEN * 2);
    }

    #[test]
    fn test_fresh_pairs_differ() {
        let a = EphemeralKeyPair::generate().unwrap();
        let b = EphemeralKeyPair::generate().unwrap();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn test_missing_peer_key() {
        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(
            pair.derive_from_hex(None),
            Err(KeyExchangeError::MissingPeerKey)
        ));

        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(
            pair.derive_from_hex(Some("  ")),
            Err(KeyExchangeError::MissingPeerKey)
        ));
    }

    #[test]
    fn test_non_hex_peer_key() {
        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(
            pair.derive_from_hex(Some("zz-not-hex")),
            Err(KeyExchangeError::InvalidPeerKey(_))
        ));
    }

    #[test]
    fn test_wrong_length_peer_key() {
        let peer = EphemeralKeyPair::generate().unwrap();
        let truncated = hex::encode(&peer.public_key_bytes()[..64]);

        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(
            pair.derive_from_hex(Some(&truncated)),
            Err(KeyExchangeError::InvalidPeerKey(_))
        ));
    }

    #[test]
    fn test_point_at_infinity_rejected() {
        // SEC1 encodes the identity as a single zero byte.
        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(
            pair.derive(&[0x00]),
            Err(KeyExchangeError::InvalidPeerKey(_))
        ));

        // Zero coordinates are not on the curve either.
        let mut zeros = [0u8; PUBLIC_KEY_LEN];
        zeros[0] = 0x04;
        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(
            pair.derive(&zeros),
            Err(KeyExchangeError::InvalidPeerKey(_))
        ));
    }

    #[test]
    fn test_off_curve_point_rejected() {
        let peer = EphemeralKeyPair::generate().unwrap();
        let mut tampered = peer.public_key_bytes().to_vec();
        tampered[40] ^= 0x01;

        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(
            pair.derive(&tampered),
            Err(KeyExchangeError::InvalidPeerKey(_))
        ));
    }

    #[test]
    fn test_compressed_point_rejected() {
        let peer = EphemeralKeyPair::generate().unwrap();
        let mut compressed = peer.public_key_bytes()[..33].to_vec();
        compressed[0] = 0x02;

        let pair = EphemeralKeyPair::generate().unwrap();
        assert!(matches!(
            pair.derive(&compressed),
            Err(KeyExchangeError::InvalidPeerKey(_))
        ));
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKey::from_shared_secret(b"secret");
        assert_eq!(format!("{:?}", key), "SessionKey(<redacted>)");
    }
}
