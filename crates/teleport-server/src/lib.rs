//! Teleport server
//!
//! Wires configuration, collaborators and the control plane together behind one TCP
//! port. The [`VhostRouter`] front door sends connections for the configured host to
//! the control handler and everything else to the tunnel that owns the host.

pub mod config;

pub use config::{ConfigError, ServerConfig, TierCap, TierCaps};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use teleport_auth::{
    AuthError, AuthGateway, HttpAuthGateway, HttpUsageReporter, NoopUsageReporter, UsageError,
    UsageReporter,
};
use teleport_control::{ControlHandler, SessionRegistry, SubdomainAllocator};
use teleport_router::{PublicListener, RouteError, RouteRegistry, VhostRouter};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to register control host: {0}")]
    Route(#[from] RouteError),

    #[error("Auth client error: {0}")]
    Auth(#[from] AuthError),

    #[error("Usage client error: {0}")]
    Usage(#[from] UsageError),
}

/// Server builder
pub struct TeleportServer {
    config: ServerConfig,
    auth: Option<Arc<dyn AuthGateway>>,
    usage: Option<Arc<dyn UsageReporter>>,
}

impl TeleportServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            auth: None,
            usage: None,
        }
    }

    /// Use `auth` instead of the HTTP gateway at `apiUrlAuth`.
    pub fn with_auth_gateway(mut self, auth: Arc<dyn AuthGateway>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Use `usage` instead of the billing client configured by `apiUrlDetails`.
    pub fn with_usage_reporter(mut self, usage: Arc<dyn UsageReporter>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Validate the configuration and bind the listening socket.
    ///
    /// With port 0 the kernel-assigned port becomes the public port.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let config = self.config;
        config.validate()?;

        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let port = local_addr.port();

        let tiers = config.tier_table();
        let auth = match self.auth {
            Some(auth) => auth,
            None => {
                if config.api_url_auth.is_empty() {
                    return Err(ConfigError::Invalid("apiUrlAuth is required".to_string()).into());
                }
                Arc::new(HttpAuthGateway::new(config.api_url_auth.clone(), tiers.clone())?)
            }
        };
        let billing = (&config.api_url_details, &config.billing_token);
        let usage: Arc<dyn UsageReporter> = match (self.usage, billing) {
            (Some(usage), _) => usage,
            (None, (Some(url), Some(token))) => {
                Arc::new(HttpUsageReporter::new(url.clone(), token.clone())?)
            }
            _ => {
                debug!("Usage reporting disabled");
                Arc::new(NoopUsageReporter)
            }
        };

        let routes = Arc::new(RouteRegistry::new());
        let allocator = Arc::new(SubdomainAllocator::new(
            routes.clone(),
            config.subdomain_prefix.clone(),
            config.host.clone(),
            port,
        ));
        let handler = ControlHandler::new(auth, allocator, tiers)
            .with_usage_reporter(usage)
            .with_encryption(config.encryption)
            .with_admission_policy(config.admission_policy)
            .with_session_timeout(Duration::from_secs(config.session_timeout_secs));

        let control_host = config.control_host(port);
        let control = routes.register(&control_host)?;

        Ok(BoundServer {
            config,
            listener,
            local_addr,
            control_host,
            control,
            routes,
            handler: Arc::new(handler),
        })
    }
}

impl std::fmt::Debug for TeleportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeleportServer")
            .field("config", &self.config)
            .field("custom_auth", &self.auth.is_some())
            .field("custom_usage", &self.usage.is_some())
            .finish()
    }
}

/// A server with its socket bound, ready to run
pub struct BoundServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    control_host: String,
    control: PublicListener,
    routes: Arc<RouteRegistry>,
    handler: Arc<ControlHandler>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Host that control connections must present
    pub fn control_host(&self) -> &str {
        &self.control_host
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.handler.sessions()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let BoundServer {
            config,
            listener,
            local_addr,
            control_host,
            control,
            routes,
            handler,
        } = self;

        let control_task = tokio::spawn(serve_control(control, handler, shutdown.clone()));

        info!(
            host = %config.host,
            %control_host,
            encryption = config.encryption,
            "Teleport server ready on {}",
            local_addr
        );
        let served = VhostRouter::new(routes).serve(listener, shutdown.clone()).await;

        // The front door is gone either way; stop the control loop too.
        shutdown.cancel();
        if let Err(e) = control_task.await {
            error!("Control loop panicked: {}", e);
        }
        served?;

        info!("Teleport server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for BoundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundServer")
            .field("local_addr", &self.local_addr)
            .field("control_host", &self.control_host)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

async fn serve_control(
    mut control: PublicListener,
    handler: Arc<ControlHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = shutdown.cancelled() => break,
            conn = control.accept() => match conn {
                Some(conn) => conn,
                None => break,
            },
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let peer_addr = conn.peer_addr();
            if let Err(e) = handler.handle_connection(conn, peer_addr).await {
                debug!(?peer_addr, "Control connection ended with error: {}", e);
            }
        });
    }
    control.close();
}
