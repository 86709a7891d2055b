//! Frame-based multiplexer over any byte transport
//!
//! Each stream carries its own send window. A sender may have at most
//! [`INITIAL_WINDOW`] unacknowledged payload bytes in flight per stream; the receiver
//! returns credit with a window update once bytes have been handed to the channel
//! handle. A reader that stops reading therefore stops its peer writer.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use teleport_proto::{Frame, FrameType, MuxCodec, MuxError, StreamId};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::MuxChannel;
use crate::MultiplexedSession;

/// In-memory buffer between a channel handle and its pumps
const CHANNEL_BUFFER_SIZE: usize = 64 * 1024;

/// Largest data frame produced by an outbound pump
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Unacknowledged payload bytes a sender may have in flight on one stream
pub const INITIAL_WINDOW: usize = 256 * 1024;

/// Frames queued for the transport writer
const OUTBOUND_QUEUE: usize = 64;

/// Channels opened by the peer that nobody has accepted yet
const ACCEPT_BACKLOG: usize = 256;

/// Which end of the control connection this session is
///
/// Clients allocate odd stream ids and servers even ones, so both sides can open
/// channels without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn allocates(self, stream_id: StreamId) -> bool {
        match self {
            Role::Client => stream_id % 2 == 1,
            Role::Server => stream_id != 0 && stream_id % 2 == 0,
        }
    }
}

/// Receiving half of a stream as seen by the read loop
struct Inbound {
    /// Holds at most one window of payload; peers that send more lose the stream
    data: mpsc::UnboundedSender<Bytes>,
    /// Payload bytes received but not yet credited back to the peer
    pending: Arc<AtomicUsize>,
}

struct Shared {
    streams: DashMap<StreamId, Inbound>,
    /// Send credit per stream, in bytes, until our side stops writing
    windows: DashMap<StreamId, Arc<Semaphore>>,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl Shared {
    fn shut_windows(&self) {
        for window in self.windows.iter() {
            window.close();
        }
        self.windows.clear();
    }
}

/// Multiplexed session over one upgraded control connection
pub struct MuxSession {
    role: Role,
    next_stream_id: AtomicU32,
    shared: Arc<Shared>,
    incoming: Mutex<mpsc::Receiver<MuxChannel>>,
}

impl MuxSession {
    /// Session for the side that dialed the control connection
    pub fn client<T>(transport: T, leftover: BytesMut) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(Role::Client, transport, leftover)
    }

    /// Session for the side that accepted the control connection
    pub fn server<T>(transport: T, leftover: BytesMut) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(Role::Server, transport, leftover)
    }

    /// Take over `transport`.
    ///
    /// `leftover` holds bytes already read from the transport past the handshake; they
    /// are decoded before anything else.
    pub fn new<T>(role: Role, transport: T, leftover: BytesMut) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            streams: DashMap::new(),
            windows: DashMap::new(),
            outbound: outbound_tx,
            closed: CancellationToken::new(),
        });

        let sink = FramedWrite::new(write_half, MuxCodec);
        tokio::spawn(write_loop(sink, outbound_rx, shared.closed.clone()));

        let reader = std::io::Cursor::new(leftover).chain(read_half);
        let frames = FramedRead::new(reader, MuxCodec);
        tokio::spawn(read_loop(role, frames, shared.clone(), incoming_tx));

        debug!(?role, "Multiplexed session started");

        Self {
            role,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            shared,
            incoming: Mutex::new(incoming_rx),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of channels currently attached
    pub fn active_streams(&self) -> usize {
        self.shared.streams.len()
    }
}

#[async_trait]
impl MultiplexedSession for MuxSession {
    type Channel = MuxChannel;

    async fn open(&self) -> Result<MuxChannel, MuxError> {
        if self.shared.closed.is_cancelled() {
            return Err(MuxError::SessionClosed);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        if self.shared.streams.contains_key(&stream_id) {
            return Err(MuxError::StreamAlreadyExists(stream_id));
        }

        let channel = attach(&self.shared, stream_id);
        self.shared
            .outbound
            .send(Frame::open(stream_id))
            .await
            .map_err(|_| MuxError::SessionClosed)?;

        trace!(stream_id, "Opened stream");
        Ok(channel)
    }

    async fn accept(&self) -> Result<Option<MuxChannel>, MuxError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            channel = incoming.recv() => Ok(channel),
            _ = self.shared.closed.cancelled() => Ok(None),
        }
    }

    async fn wait(&self) {
        self.shared.closed.cancelled().await;
    }

    async fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            debug!(role = ?self.role, "Closing multiplexed session");
        }
        self.shared.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("role", &self.role)
            .field("active_streams", &self.shared.streams.len())
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

/// Register a stream and spawn the two pumps behind its channel handle.
fn attach(shared: &Arc<Shared>, stream_id: StreamId) -> MuxChannel {
    let (app_side, pump_side) = tokio::io::duplex(CHANNEL_BUFFER_SIZE);
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let window = Arc::new(Semaphore::new(INITIAL_WINDOW));

    shared.streams.insert(
        stream_id,
        Inbound {
            data: data_tx,
            pending: pending.clone(),
        },
    );
    shared.windows.insert(stream_id, window.clone());

    let (pump_read, pump_write) = tokio::io::split(pump_side);
    tokio::spawn(deliver_inbound(
        stream_id,
        data_rx,
        pending,
        pump_write,
        shared.clone(),
    ));
    tokio::spawn(forward_outbound(stream_id, pump_read, window, shared.clone()));

    MuxChannel::new(stream_id, app_side)
}

/// Peer data frames into the channel handle, returning credit as it drains
///
/// Once the handle is gone the data is discarded but still credited, so the peer
/// writer is never left waiting on a window nobody will open.
async fn deliver_inbound(
    stream_id: StreamId,
    mut data_rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Arc<AtomicUsize>,
    mut writer: WriteHalf<DuplexStream>,
    shared: Arc<Shared>,
) {
    let mut attached = true;

    while let Some(chunk) = data_rx.recv().await {
        if attached {
            if let Err(e) = writer.write_all(&chunk).await {
                trace!(stream_id, "Channel handle gone: {}", e);
                attached = false;
            }
        }

        pending.fetch_sub(chunk.len(), Ordering::AcqRel);
        let update = Frame::window_update(stream_id, chunk.len() as u32);
        if shared.outbound.send(update).await.is_err() {
            return;
        }
    }

    if attached {
        let _ = writer.shutdown().await;
    }
}

/// Bytes written to the channel handle out as data frames, within the send window
async fn forward_outbound(
    stream_id: StreamId,
    mut reader: ReadHalf<DuplexStream>,
    window: Arc<Semaphore>,
    shared: Arc<Shared>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

    loop {
        buf.reserve(READ_CHUNK_SIZE);
        let mut limited = (&mut reader).take(READ_CHUNK_SIZE as u64);
        let read = tokio::select! {
            result = limited.read_buf(&mut buf) => result,
            _ = shared.closed.cancelled() => break,
        };

        let len = match read {
            Ok(0) => {
                let _ = shared.outbound.send(Frame::close(stream_id)).await;
                break;
            }
            Ok(len) => len,
            Err(e) => {
                trace!(stream_id, "Channel read failed: {}", e);
                let _ = shared.outbound.send(Frame::close(stream_id)).await;
                break;
            }
        };

        // READ_CHUNK_SIZE bounds len, so the cast cannot truncate.
        match window.acquire_many(len as u32).await {
            Ok(permits) => permits.forget(),
            Err(_) => break,
        }

        let frame = Frame::data(stream_id, buf.split().freeze());
        if shared.outbound.send(frame).await.is_err() {
            break;
        }
    }

    shared.windows.remove(&stream_id);
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, MuxCodec>,
    mut outbound: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!("Multiplexer write failed: {}", e);
                        closed.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => break,
        }
    }

    // Flush whatever the pumps queued before the session went away.
    while let Ok(frame) = outbound.try_recv() {
        if sink.feed(frame).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Frame::go_away()).await;
    let _ = sink.close().await;
}

/// Forget a stream in both directions.
fn drop_stream(shared: &Shared, stream_id: StreamId) {
    shared.streams.remove(&stream_id);
    if let Some((_, window)) = shared.windows.remove(&stream_id) {
        window.close();
    }
}

async fn read_loop<R>(
    role: Role,
    mut frames: FramedRead<R, MuxCodec>,
    shared: Arc<Shared>,
    incoming: mpsc::Sender<MuxChannel>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            next = frames.next() => next,
            _ = shared.closed.cancelled() => break,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("Multiplexer read failed: {}", e);
                break;
            }
            None => {
                debug!("Multiplexer transport closed");
                break;
            }
        };

        let stream_id = frame.stream_id;
        match frame.frame_type {
            FrameType::Open => {
                if role.allocates(stream_id) || shared.streams.contains_key(&stream_id) {
                    warn!(stream_id, "Peer opened an invalid stream id");
                    continue;
                }

                let channel = attach(&shared, stream_id);
                if incoming.try_send(channel).is_err() {
                    // Dropping the handle makes its pump send a close frame.
                    warn!(stream_id, "Accept backlog full, refusing stream");
                }
            }
            FrameType::Data => {
                let len = frame.payload.len();
                let overrun = match shared.streams.get(&stream_id) {
                    Some(inbound) => {
                        let pending = inbound.pending.fetch_add(len, Ordering::AcqRel) + len;
                        let _ = inbound.data.send(frame.payload);
                        pending > INITIAL_WINDOW
                    }
                    None => {
                        trace!(stream_id, "Data for unknown stream");
                        false
                    }
                };
                if overrun {
                    warn!(stream_id, "Peer overran the stream window, dropping stream");
                    drop_stream(&shared, stream_id);
                }
            }
            FrameType::WindowUpdate => match frame.credit() {
                Some(credit) => {
                    if let Some(window) = shared.windows.get(&stream_id) {
                        // Never more than a full window, whatever the peer claims.
                        let room = INITIAL_WINDOW.saturating_sub(window.available_permits());
                        window.add_permits((credit as usize).min(room));
                    }
                }
                None => warn!(stream_id, "Malformed window update"),
            },
            FrameType::Close => {
                shared.streams.remove(&stream_id);
            }
            FrameType::GoAway => {
                debug!("Peer closed the session");
                break;
            }
        }
    }

    shared.closed.cancel();
    shared.streams.clear();
    shared.shut_windows();
}
