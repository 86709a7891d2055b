//! Byte relay between a forwarded connection and a tunnel channel
//!
//! The relay always joins one *plain* endpoint (the public connection on the server,
//! the local service connection on the agent) with one *sealed* endpoint (the tunnel
//! channel). In encrypted mode every chunk read from the plain side leaves as one
//! length-prefixed AES-GCM frame, and every frame read from the sealed side is
//! authenticated before its plaintext is forwarded.

use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use teleport_crypto::{CipherError, FrameError, SealedFrameCodec, SessionCipher};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

/// Largest plaintext chunk sealed into one frame
pub const CHUNK_SIZE: usize = 4096;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame corrupted or tampered: {0}")]
    Corrupted(CipherError),
}

impl From<FrameError> for RelayError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => RelayError::Io(e),
            FrameError::Corrupted(e) => RelayError::Corrupted(e),
            FrameError::TooLarge(len) => RelayError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk of {} bytes does not fit in a frame", len),
            )),
        }
    }
}

/// Plaintext byte counts for one relayed connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Read from the plain endpoint and sent towards the tunnel
    pub plain_to_sealed: u64,
    /// Received from the tunnel and written to the plain endpoint
    pub sealed_to_plain: u64,
}

/// How a session relays its forwarded connections
#[derive(Debug, Clone)]
pub enum RelayMode {
    Encrypted(SessionCipher),
    Plain,
}

impl RelayMode {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, RelayMode::Encrypted(_))
    }

    /// Relay until one direction ends, then close both endpoints.
    pub async fn run<P, S>(&self, plain: P, sealed: S) -> Result<RelayStats, RelayError>
    where
        P: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self {
            RelayMode::Encrypted(cipher) => relay_encrypted(plain, sealed, cipher.clone()).await,
            RelayMode::Plain => relay_plain(plain, sealed).await,
        }
    }
}

/// Encrypted relay
///
/// Either pump reaching end of stream, failing, or rejecting a frame stops the other
/// pump and shuts down both endpoints. Half-close is not carried: the first EOF in
/// either direction ends the whole relay, so a peer that shuts down its write side
/// and then waits for a reply will not get one.
pub async fn relay_encrypted<P, S>(
    plain: P,
    sealed: S,
    cipher: SessionCipher,
) -> Result<RelayStats, RelayError>
where
    P: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut plain_read, mut plain_write) = tokio::io::split(plain);
    let (sealed_read, sealed_write) = tokio::io::split(sealed);
    let mut frames_out = FramedWrite::new(sealed_write, SealedFrameCodec::new(cipher.clone()));
    let mut frames_in = FramedRead::new(sealed_read, SealedFrameCodec::new(cipher));

    let mut stats = RelayStats::default();
    let result = tokio::select! {
        result = seal_pump(&mut plain_read, &mut frames_out, &mut stats.plain_to_sealed) => {
            trace!("Seal pump finished first");
            result
        }
        result = open_pump(&mut frames_in, &mut plain_write, &mut stats.sealed_to_plain) => {
            trace!("Open pump finished first");
            result
        }
    };

    let _ = frames_out.close().await;
    let _ = plain_write.shutdown().await;

    match result {
        Ok(()) => {
            debug!(
                "Relay complete: {} bytes sealed, {} bytes opened",
                stats.plain_to_sealed, stats.sealed_to_plain
            );
            Ok(stats)
        }
        Err(RelayError::Corrupted(e)) => {
            warn!("Rejected tunnel frame, closing relay: {}", e);
            Err(RelayError::Corrupted(e))
        }
        Err(e) => {
            debug!("Relay ended with error: {}", e);
            Err(e)
        }
    }
}

/// Plain endpoint to sealed frames
async fn seal_pump<R, W>(
    plain: &mut R,
    frames: &mut FramedWrite<W, SealedFrameCodec>,
    total: &mut u64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = plain.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        frames.send(Bytes::copy_from_slice(&buf[..n])).await?;
        *total += n as u64;
    }
}

/// Sealed frames to plain endpoint
async fn open_pump<R, W>(
    frames: &mut FramedRead<R, SealedFrameCodec>,
    plain: &mut W,
    total: &mut u64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = frames.next().await {
        let chunk = chunk?;
        plain.write_all(&chunk).await?;
        *total += chunk.len() as u64;
    }
    plain.flush().await?;
    Ok(())
}

/// Unencrypted relay with half-close propagation
///
/// Unlike [`relay_encrypted`], an EOF on one side only shuts down the write side of
/// the other; the reverse direction keeps flowing until it ends too.
pub async fn relay_plain<P, S>(mut plain: P, mut sealed: S) -> Result<RelayStats, RelayError>
where
    P: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (plain_to_sealed, sealed_to_plain) =
        tokio::io::copy_bidirectional(&mut plain, &mut sealed).await?;
    debug!(
        "Plain relay complete: {} bytes out, {} bytes in",
        plain_to_sealed, sealed_to_plain
    );
    Ok(RelayStats {
        plain_to_sealed,
        sealed_to_plain,
    })
}
