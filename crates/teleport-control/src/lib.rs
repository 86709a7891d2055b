//! Tunnel control plane
//!
//! Authenticated session establishment, per-client admission control and the accept
//! loop that pairs public connections with tunnel channels.

pub mod admission;
pub mod allocator;
pub mod handler;
pub mod rate_limit;
pub mod registry;

pub use admission::{AdmissionController, AdmissionError, AdmissionPolicy, AdmissionTicket};
pub use allocator::{Allocation, AllocationError, SubdomainAllocator, SUFFIX_LEN};
pub use handler::{
    ControlError, ControlHandler, DEFAULT_DRAIN_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_SESSION_TIMEOUT,
};
pub use rate_limit::TokenBucket;
pub use registry::{ClientSession, SessionGuard, SessionRegistry};
