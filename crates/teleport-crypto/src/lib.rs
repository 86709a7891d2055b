//! Session cryptography for encrypted tunnels
//!
//! - [`EphemeralKeyPair`]: per-session ECDH on P-256, hashed with SHA-256 into a
//!   [`SessionKey`]
//! - [`SessionCipher`]: AES-256-GCM with a fresh random nonce for every sealed chunk
//! - [`SealedFrameCodec`]: length-prefixed `nonce || ciphertext || tag` frames so the
//!   receiver can recover exact frame boundaries from a byte stream

pub mod cipher;
pub mod frame;
pub mod key_exchange;

pub use cipher::{CipherError, SessionCipher, NONCE_LEN, TAG_LEN};
pub use frame::{FrameError, SealedFrameCodec, LENGTH_FIELD_LEN, MAX_SEALED_FRAME_LEN};
pub use key_exchange::{EphemeralKeyPair, KeyExchangeError, SessionKey, PUBLIC_KEY_LEN};
