//! Virtual-host routing for public traffic
//!
//! Every connection that reaches the front door is routed by its `Host` header to the
//! [`PublicListener`] registered for that host. Tunnel sessions only see the
//! [`HostRouter`] capability.

pub mod listener;
pub mod registry;
pub mod vhost;

pub use listener::{PublicConnection, PublicListener};
pub use registry::{normalize_host, DispatchError, RouteError, RouteRegistry};
pub use vhost::VhostRouter;

/// Hands out one dedicated listener per virtual host
pub trait HostRouter: Send + Sync {
    /// Start receiving connections for `host`.
    ///
    /// The route stays registered until the returned listener is closed or dropped.
    fn listen(&self, host: &str) -> Result<PublicListener, RouteError>;
}
