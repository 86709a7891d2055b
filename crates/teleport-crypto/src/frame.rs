//! Length-prefixed sealed frames
//!
//! Wire layout: `u32 BE length || nonce (12) || ciphertext || tag (16)`, where the length
//! counts everything after the prefix.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::cipher::{CipherError, SessionCipher, NONCE_LEN, TAG_LEN};

/// Size of the length prefix
pub const LENGTH_FIELD_LEN: usize = 4;

/// Largest sealed body accepted from the wire
pub const MAX_SEALED_FRAME_LEN: usize = 64 * 1024;

/// Largest plaintext that fits in one frame
pub const MAX_PLAINTEXT_LEN: usize = MAX_SEALED_FRAME_LEN - NONCE_LEN - TAG_LEN;

/// Sealed frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted frame: {0}")]
    Corrupted(#[from] CipherError),

    #[error("Plaintext too large for one frame: {0} bytes")]
    TooLarge(usize),
}

/// Seals outbound chunks and opens inbound frames with the session cipher
#[derive(Debug)]
pub struct SealedFrameCodec {
    cipher: SessionCipher,
    inner: LengthDelimitedCodec,
}

impl SealedFrameCodec {
    pub fn new(cipher: SessionCipher) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_FIELD_LEN)
            .max_frame_length(MAX_SEALED_FRAME_LEN)
            .new_codec();

        Self { cipher, inner }
    }
}

impl Decoder for SealedFrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        match self.inner.decode(src)? {
            Some(sealed) => {
                let plaintext = self.cipher.open(&sealed)?;
                Ok(Some(BytesMut::from(&plaintext[..])))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for SealedFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, plaintext: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(FrameError::TooLarge(plaintext.len()));
        }

        let sealed = self.cipher.seal(&plaintext)?;
        self.inner.encode(Bytes::from(sealed), dst)?;
        Ok(())
    }
}
