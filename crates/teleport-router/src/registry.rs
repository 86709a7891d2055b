//! Host route registry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::listener::{PublicConnection, PublicListener};
use crate::HostRouter;

/// Connections queued per host before the router answers 503
pub const DEFAULT_BACKLOG: usize = 128;

/// Route registry errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Route already exists: {0}")]
    RouteAlreadyExists(String),

    #[error("Invalid host: {0:?}")]
    InvalidHost(String),
}

/// Why a connection could not be handed to a listener
///
/// The connection is handed back so the caller can still answer on it.
#[derive(Debug)]
pub enum DispatchError {
    NotFound(PublicConnection),
    Busy(PublicConnection),
}

struct RouteEntry {
    id: u64,
    sender: mpsc::Sender<PublicConnection>,
}

type Routes = Arc<DashMap<String, RouteEntry>>;

/// Unregisters a host when its listener goes away
pub(crate) struct RouteGuard {
    routes: Routes,
    host: String,
    id: u64,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        // A newer registration for the same host must survive.
        if self
            .routes
            .remove_if(&self.host, |_, entry| entry.id == self.id)
            .is_some()
        {
            debug!("Unregistered route for host: {}", self.host);
        }
    }
}

/// Maps normalized hosts to their listeners
pub struct RouteRegistry {
    routes: Routes,
    next_id: AtomicU64,
    backlog: usize,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            backlog: backlog.max(1),
        }
    }

    /// Register `host` and return the listener that receives its connections.
    pub fn register(&self, host: &str) -> Result<PublicListener, RouteError> {
        let key = normalize_host(host);
        if key.is_empty() {
            return Err(RouteError::InvalidHost(host.to_string()));
        }

        match self.routes.entry(key.clone()) {
            Entry::Occupied(_) => Err(RouteError::RouteAlreadyExists(key)),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (sender, incoming) = mpsc::channel(self.backlog);
                vacant.insert(RouteEntry { id, sender });

                debug!("Registered route for host: {}", key);
                let guard = RouteGuard {
                    routes: self.routes.clone(),
                    host: key.clone(),
                    id,
                };
                Ok(PublicListener::registered(key, incoming, guard))
            }
        }
    }

    /// Queue `conn` on the listener registered for `host`.
    pub fn dispatch(&self, host: &str, conn: PublicConnection) -> Result<(), DispatchError> {
        let key = normalize_host(host);
        trace!("Looking up route for host: {}", key);

        let sender = match self.routes.get(&key) {
            Some(entry) => entry.sender.clone(),
            None => return Err(DispatchError::NotFound(conn)),
        };

        sender.try_send(conn).map_err(|e| match e {
            TrySendError::Full(conn) => DispatchError::Busy(conn),
            TrySendError::Closed(conn) => DispatchError::NotFound(conn),
        })
    }

    pub fn contains(&self, host: &str) -> bool {
        self.routes.contains_key(&normalize_host(host))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRouter for RouteRegistry {
    fn listen(&self, host: &str) -> Result<PublicListener, RouteError> {
        self.register(host)
    }
}

/// Lowercase `host` and strip any port and trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.strip_prefix('[') {
        Some(bracketed) => bracketed.split(']').next().unwrap_or(bracketed),
        None => host.split(':').next().unwrap_or(host),
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}
