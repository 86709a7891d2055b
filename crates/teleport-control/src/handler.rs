//! Control connection handler
//!
//! One call to [`ControlHandler::handle_connection`] drives a control connection through
//! its whole life: authenticate, exchange keys, allocate a public host, upgrade to a
//! multiplexed session, then pair every admitted public connection with a fresh tunnel
//! channel until the session ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use teleport_auth::{
    AuthError, AuthGateway, Credentials, NoopUsageReporter, SubscriptionTier, TierTable,
    UsageReporter,
};
use teleport_connection::{MultiplexedSession, MuxSession};
use teleport_crypto::{CipherError, EphemeralKeyPair, KeyExchangeError, SessionCipher};
use teleport_proto::{read_request, ControlResponse, HandshakeError};
use teleport_relay::RelayError;
use teleport_router::PublicListener;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionError, AdmissionPolicy};
use crate::allocator::{AllocationError, SubdomainAllocator};
use crate::registry::{ClientSession, SessionGuard, SessionRegistry};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const HANDSHAKE_BUFFER_SIZE: usize = 4096;

/// Control session errors
///
/// Everything up to the upgrade is reported to the client through the HTTP status of
/// the handshake response.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    #[error("Cipher setup failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("Allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Handshake not received within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// HTTP status written back for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ControlError::Auth(_) => 401,
            ControlError::KeyExchange(
                KeyExchangeError::MissingPeerKey | KeyExchangeError::InvalidPeerKey(_),
            ) => 400,
            ControlError::Handshake(
                HandshakeError::Malformed(_) | HandshakeError::HeadTooLarge(_),
            ) => 400,
            _ => 500,
        }
    }

    /// Body of the error response. Internal failures stay opaque.
    fn client_message(&self) -> String {
        match self.status_code() {
            401 => "Authentication failed".to_string(),
            400 => self.to_string(),
            _ => "Server error".to_string(),
        }
    }

    /// Whether the peer is still there to read a response
    fn can_respond(&self) -> bool {
        !matches!(
            self,
            ControlError::Io(_)
                | ControlError::Handshake(HandshakeError::Io(_) | HandshakeError::ConnectionClosed)
        )
    }
}

/// What a successful handshake produced
struct Established {
    identity: String,
    tier: SubscriptionTier,
    cipher: Option<SessionCipher>,
    server_public_key: Option<String>,
    label: String,
    public_host: String,
    listener: PublicListener,
}

/// Handles control connections
pub struct ControlHandler {
    auth: Arc<dyn AuthGateway>,
    allocator: Arc<SubdomainAllocator>,
    sessions: Arc<SessionRegistry>,
    tiers: TierTable,
    usage: Arc<dyn UsageReporter>,
    encryption: bool,
    policy: AdmissionPolicy,
    handshake_timeout: Duration,
    session_timeout: Duration,
    drain_timeout: Duration,
}

impl ControlHandler {
    pub fn new(
        auth: Arc<dyn AuthGateway>,
        allocator: Arc<SubdomainAllocator>,
        tiers: TierTable,
    ) -> Self {
        Self {
            auth,
            allocator,
            sessions: Arc::new(SessionRegistry::new()),
            tiers,
            usage: Arc::new(NoopUsageReporter),
            encryption: true,
            policy: AdmissionPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_usage_reporter(mut self, usage: Arc<dyn UsageReporter>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_session_registry(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Require the key exchange and seal every forwarded byte. On by default.
    pub fn with_encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_admission_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Absolute bound on a session's lifetime
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// How long running relays may finish once a session has ended
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn encryption(&self) -> bool {
        self.encryption
    }

    /// Serve one control connection until its session ends.
    ///
    /// Handshake failures are answered with an HTTP error and leave no session state
    /// behind. Once the session is up, errors stay local to the affected relay.
    pub async fn handle_connection<S>(
        &self,
        mut stream: S,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(), ControlError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!(?peer_addr, "New control connection");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_BUFFER_SIZE);

        let established = match self.establish(&mut stream, &mut buf).await {
            Ok(established) => established,
            Err(e) => {
                warn!(
                    ?peer_addr,
                    status = e.status_code(),
                    "Control handshake failed: {}",
                    e
                );
                if e.can_respond() {
                    let response = ControlResponse::error(e.status_code(), e.client_message());
                    if let Err(write_err) = write_response(&mut stream, &response).await {
                        debug!("Failed to send handshake error: {}", write_err);
                    }
                    let _ = stream.shutdown().await;
                }
                return Err(e);
            }
        };

        let Established {
            identity,
            tier,
            cipher,
            server_public_key,
            label,
            public_host,
            listener,
        } = established;

        let limits = self.tiers.limits(tier);
        let shutdown = CancellationToken::new();
        let admission =
            AdmissionController::new(limits, self.policy).with_cancellation(shutdown.clone());
        let session = Arc::new(ClientSession {
            session_id: Uuid::new_v4(),
            identity,
            tier,
            subdomain: label,
            public_host,
            admission: Arc::new(admission),
            cipher,
            shutdown,
            created_at: Utc::now(),
        });
        let guard = self.sessions.insert(session.clone());

        let response = ControlResponse::ok(session.public_host.clone(), server_public_key);
        write_response(&mut stream, &response).await?;

        self.spawn_url_report(&session);

        info!(
            identity = %session.identity,
            public_host = %session.public_host,
            tier = %session.tier,
            encrypted = session.cipher.is_some(),
            "Session started"
        );

        let mux = Arc::new(MuxSession::server(stream, buf));
        self.run_session(session, mux, listener, guard).await;
        Ok(())
    }

    async fn establish<S>(
        &self,
        stream: &mut S,
        buf: &mut BytesMut,
    ) -> Result<Established, ControlError>
    where
        S: AsyncRead + Unpin,
    {
        let request = tokio::time::timeout(self.handshake_timeout, read_request(stream, buf))
            .await
            .map_err(|_| ControlError::HandshakeTimeout(self.handshake_timeout))??;
        debug!(?request, "Control handshake received");

        let credentials = Credentials::new(request.username, request.password)?;
        let sign_in = self.auth.sign_in(&credentials).await?;
        let identity = if sign_in.user_name.is_empty() {
            credentials.username.clone()
        } else {
            sign_in.user_name.clone()
        };

        // Validate the client key before anything is registered.
        let (cipher, server_public_key) = if self.encryption {
            let key_pair = EphemeralKeyPair::generate()?;
            let server_public_key = key_pair.public_key_hex();
            let session_key = key_pair.derive_from_hex(request.client_public_key.as_deref())?;
            (Some(SessionCipher::new(&session_key)?), Some(server_public_key))
        } else {
            (None, None)
        };

        let allocation = self.allocator.allocate(&identity)?;

        Ok(Established {
            identity,
            tier: sign_in.tier,
            cipher,
            server_public_key,
            label: allocation.label,
            public_host: allocation.public_host,
            listener: allocation.listener,
        })
    }

    async fn run_session<M>(
        &self,
        session: Arc<ClientSession>,
        mux: Arc<M>,
        listener: PublicListener,
        guard: SessionGuard,
    ) where
        M: MultiplexedSession + 'static,
    {
        let accept_task = tokio::spawn(accept_loop(
            session.clone(),
            mux.clone(),
            listener,
            self.usage.clone(),
        ));

        tokio::select! {
            _ = mux.wait() => {
                debug!(public_host = %session.public_host, "Multiplexed session ended");
            }
            _ = tokio::time::sleep(self.session_timeout) => {
                info!(public_host = %session.public_host, "Session reached its time limit");
            }
            _ = session.shutdown.cancelled() => {
                info!(public_host = %session.public_host, "Session shut down");
            }
        }

        // Stop admissions and unregister before draining.
        session.shutdown.cancel();
        drop(guard);

        let mut relays = match accept_task.await {
            Ok(relays) => relays,
            Err(e) => {
                error!("Accept loop panicked: {}", e);
                JoinSet::new()
            }
        };

        if !relays.is_empty() {
            debug!(remaining = relays.len(), "Draining relays");
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while relays.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    public_host = %session.public_host,
                    remaining = relays.len(),
                    "Relays did not drain in time, aborting"
                );
                relays.shutdown().await;
            }
        }

        mux.close().await;
        info!(
            identity = %session.identity,
            public_host = %session.public_host,
            "Session ended"
        );
    }

    fn spawn_url_report(&self, session: &ClientSession) {
        let usage = self.usage.clone();
        let user_name = session.identity.clone();
        let url = session.public_host.clone();
        let at = session.created_at;
        tokio::spawn(async move {
            if let Err(e) = usage.record_public_url(&user_name, &url, at).await {
                warn!(%url, "Failed to record public URL: {}", e);
            }
        });
    }
}

impl std::fmt::Debug for ControlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandler")
            .field("allocator", &self.allocator)
            .field("sessions", &self.sessions.len())
            .field("encryption", &self.encryption)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

async fn write_response<S>(stream: &mut S, response: &ControlResponse) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&response.encode()).await?;
    stream.flush().await
}

/// Admit, accept, open, relay. Returns the relays still running when the session ends.
async fn accept_loop<M>(
    session: Arc<ClientSession>,
    mux: Arc<M>,
    mut listener: PublicListener,
    usage: Arc<dyn UsageReporter>,
) -> JoinSet<()>
where
    M: MultiplexedSession + 'static,
{
    let relay_mode = session.relay_mode();
    let mut relays = JoinSet::new();
    let mut stopped = false;

    loop {
        let ticket = tokio::select! {
            biased;

            _ = session.shutdown.cancelled() => break,
            Some(joined) = relays.join_next(), if !relays.is_empty() => {
                log_join(joined);
                continue;
            }
            admitted = session.admission.admit() => match admitted {
                Ok(ticket) => ticket,
                Err(AdmissionError::Cancelled) => break,
                Err(e) => {
                    info!(
                        public_host = %session.public_host,
                        tier = %session.tier,
                        "No longer accepting connections: {}",
                        e
                    );
                    stopped = true;
                    break;
                }
            },
        };

        let public = tokio::select! {
            _ = session.shutdown.cancelled() => break,
            conn = listener.accept() => match conn {
                Some(conn) => conn,
                None => {
                    debug!(public_host = %session.public_host, "Public listener closed");
                    break;
                }
            },
        };

        let channel = match mux.open().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(public_host = %session.public_host, "Failed to open tunnel channel: {}", e);
                break;
            }
        };
        debug!(peer_addr = ?public.peer_addr(), "Forwarding public connection");

        let report = usage.clone();
        let user_name = session.identity.clone();
        let url = session.public_host.clone();
        tokio::spawn(async move {
            if let Err(e) = report.record_connection(&user_name, &url).await {
                warn!(%url, "Failed to record connection: {}", e);
            }
        });

        let mode = relay_mode.clone();
        relays.spawn(async move {
            // Held until the relay is done, on every path.
            let _ticket = ticket;
            match mode.run(public, channel).await {
                Ok(stats) => debug!(
                    inbound = stats.plain_to_sealed,
                    outbound = stats.sealed_to_plain,
                    "Relay finished"
                ),
                Err(RelayError::Corrupted(_)) => {}
                Err(e) => debug!("Relay ended with error: {}", e),
            }
        });
    }

    if stopped {
        // The route stays owned by this session until it ends.
        loop {
            tokio::select! {
                _ = session.shutdown.cancelled() => break,
                Some(joined) = relays.join_next(), if !relays.is_empty() => log_join(joined),
            }
        }
    }

    listener.close();
    relays
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Relay task panicked: {}", e);
        }
    }
}
