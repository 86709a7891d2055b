//! Tunnel agent: control handshake and channel forwarding

use std::sync::Arc;

use bytes::BytesMut;
use teleport_connection::{MultiplexedSession, MuxChannel, MuxError, MuxSession};
use teleport_crypto::{CipherError, EphemeralKeyPair, KeyExchangeError, SessionCipher};
use teleport_proto::{read_response, ControlRequest, HandshakeError};
use teleport_relay::RelayMode;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Server rejected tunnel ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Server response did not include a public host")]
    MissingPublicHost,

    #[error("Key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    #[error("Cipher setup failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("Tunnel session error: {0}")]
    Session(#[from] MuxError),
}

/// Client side of the tunnel
#[derive(Debug, Clone)]
pub struct TunnelAgent {
    config: AgentConfig,
}

impl TunnelAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Dial the control endpoint and complete the handshake.
    pub async fn connect(&self) -> Result<ConnectedAgent, AgentError> {
        let server_addr = self.config.server_addr();
        info!("Connecting to {}", server_addr);

        let connect = TcpStream::connect(&server_addr);
        let stream = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| AgentError::ConnectTimeout(server_addr.clone()))??;
        stream.set_nodelay(true)?;

        self.handshake(stream).await
    }

    /// Run the control handshake over an already connected transport.
    pub async fn handshake<S>(&self, mut stream: S) -> Result<ConnectedAgent, AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let key_pair = if self.config.encryption {
            Some(EphemeralKeyPair::generate()?)
        } else {
            None
        };

        let request = ControlRequest {
            host: Some(self.config.server_addr()),
            username: Some(self.config.username.clone()),
            password: Some(self.config.password.clone()),
            client_public_key: key_pair.as_ref().map(EphemeralKeyPair::public_key_hex),
        };
        stream.write_all(&request.encode()).await?;
        stream.flush().await?;
        debug!("Sent control handshake");

        let mut buf = BytesMut::new();
        let read = read_response(&mut stream, &mut buf);
        let response = tokio::time::timeout(self.config.connect_timeout, read)
            .await
            .map_err(|_| AgentError::ConnectTimeout(self.config.server_addr()))??;

        if !response.is_success() {
            let message = response.message.unwrap_or_default().trim().to_string();
            return Err(match response.status {
                401 => AgentError::AuthenticationFailed(message),
                status => AgentError::Rejected { status, message },
            });
        }

        let public_host = response.public_host.ok_or(AgentError::MissingPublicHost)?;
        let relay_mode = match key_pair {
            Some(key_pair) => {
                let session_key = key_pair.derive_from_hex(response.server_public_key.as_deref())?;
                RelayMode::Encrypted(SessionCipher::new(&session_key)?)
            }
            None => {
                if response.server_public_key.is_some() {
                    warn!("Server offered a session key but encryption is disabled");
                }
                RelayMode::Plain
            }
        };

        info!(
            %public_host,
            encrypted = relay_mode.is_encrypted(),
            "Tunnel established"
        );

        Ok(ConnectedAgent {
            public_host,
            mux: Arc::new(MuxSession::client(stream, buf)),
            relay_mode,
            local_addr: self.config.local_addr.clone(),
            connections: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
        })
    }
}

/// An established tunnel, ready to forward
pub struct ConnectedAgent {
    public_host: String,
    mux: Arc<MuxSession>,
    relay_mode: RelayMode,
    local_addr: String,
    connections: Arc<Semaphore>,
}

impl ConnectedAgent {
    /// Public host assigned by the server
    pub fn public_host(&self) -> &str {
        &self.public_host
    }

    pub fn is_encrypted(&self) -> bool {
        self.relay_mode.is_encrypted()
    }

    /// Forward server-opened channels to the local service until the session ends or
    /// `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let result = loop {
            let channel = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down tunnel");
                    break Ok(());
                }
                accepted = self.mux.accept() => match accepted {
                    Ok(Some(channel)) => channel,
                    Ok(None) => {
                        info!(public_host = %self.public_host, "Tunnel session closed");
                        break Ok(());
                    }
                    Err(e) => break Err(AgentError::Session(e)),
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                permit = self.connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            tokio::spawn(forward(
                channel,
                self.local_addr.clone(),
                self.relay_mode.clone(),
                permit,
            ));
        };

        self.mux.close().await;
        result
    }

    /// Close the tunnel session.
    pub async fn close(&self) {
        self.mux.close().await;
    }
}

impl std::fmt::Debug for ConnectedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedAgent")
            .field("public_host", &self.public_host)
            .field("local_addr", &self.local_addr)
            .field("encrypted", &self.relay_mode.is_encrypted())
            .finish()
    }
}

async fn forward(
    channel: MuxChannel,
    local_addr: String,
    mode: RelayMode,
    _permit: OwnedSemaphorePermit,
) {
    let stream_id = channel.stream_id();
    let local = match TcpStream::connect(&local_addr).await {
        Ok(local) => local,
        Err(e) => {
            // Dropping the channel closes the public connection.
            error!(stream_id, "Failed to connect to local service at {}: {}", local_addr, e);
            return;
        }
    };
    let _ = local.set_nodelay(true);

    match mode.run(local, channel).await {
        Ok(stats) => debug!(
            stream_id,
            sent = stats.plain_to_sealed,
            received = stats.sealed_to_plain,
            "Forwarded connection closed"
        ),
        Err(e) => debug!(stream_id, "Forwarded connection failed: {}", e),
    }
}
