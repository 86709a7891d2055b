//! Subdomain allocation
//!
//! Labels look like `<prefix>-<identity>-<suffix>` where the suffix is drawn uniformly
//! from 36 characters. Uniqueness is statistical; a collision shows up as the router
//! refusing the host.

use std::sync::Arc;

use rand::Rng;
use teleport_router::{HostRouter, PublicListener, RouteError};
use thiserror::Error;
use tracing::debug;

/// Random suffix length
pub const SUFFIX_LEN: usize = 10;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Longest identity fragment carried into a label
const MAX_IDENTITY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Failed to register {host}: {source}")]
    Route {
        host: String,
        #[source]
        source: RouteError,
    },
}

/// A registered public host and the listener that receives its connections
#[derive(Debug)]
pub struct Allocation {
    pub label: String,
    pub public_host: String,
    pub listener: PublicListener,
}

pub struct SubdomainAllocator {
    router: Arc<dyn HostRouter>,
    prefix: String,
    host: String,
    port: u16,
}

impl SubdomainAllocator {
    /// `host` and `port` form the public suffix; port 80 is left out of public hosts.
    pub fn new(
        router: Arc<dyn HostRouter>,
        prefix: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            router,
            prefix: sanitize(&prefix.into()),
            host: host.into(),
            port,
        }
    }

    /// Fresh label for `identity`
    pub fn label_for(&self, identity: &str) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();

        let mut identity = sanitize(identity);
        identity.truncate(MAX_IDENTITY_LEN);
        let identity = identity.trim_end_matches('-');

        [self.prefix.as_str(), identity, suffix.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// `<label>.<host>:<port>`, without `:80`
    pub fn public_host(&self, label: &str) -> String {
        let host = format!("{}.{}:{}", label, self.host, self.port);
        match host.strip_suffix(":80") {
            Some(trimmed) => trimmed.to_string(),
            None => host,
        }
    }

    /// Pick a label for `identity` and register it with the router.
    pub fn allocate(&self, identity: &str) -> Result<Allocation, AllocationError> {
        let label = self.label_for(identity);
        let public_host = self.public_host(&label);

        let listener = self
            .router
            .listen(&public_host)
            .map_err(|source| AllocationError::Route {
                host: public_host.clone(),
                source,
            })?;
        debug!(%public_host, "Allocated public host");

        Ok(Allocation {
            label,
            public_host,
            listener,
        })
    }
}

impl std::fmt::Debug for SubdomainAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubdomainAllocator")
            .field("prefix", &self.prefix)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Lowercase DNS-label characters, everything else collapsed to single hyphens
fn sanitize(raw: &str) -> String {
    let mut label = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            label.push(ch);
        } else if !label.is_empty() && !label.ends_with('-') {
            label.push('-');
        }
    }
    label.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use teleport_router::RouteRegistry;

    /// Records requested hosts and refuses the ones listed as taken
    #[derive(Default)]
    struct RecordingRouter {
        requested: Mutex<Vec<String>>,
        taken: HashSet<String>,
    }

    impl HostRouter for RecordingRouter {
        fn listen(&self, host: &str) -> Result<PublicListener, RouteError> {
            self.requested.lock().unwrap().push(host.to_string());
            if self.taken.iter().any(|t| host.starts_with(t.as_str())) {
                return Err(RouteError::RouteAlreadyExists(host.to_string()));
            }
            Ok(PublicListener::channel(host, 1).1)
        }
    }

    #[test]
    fn test_label_shape() {
        let allocator = SubdomainAllocator::new(
            Arc::new(RecordingRouter::default()),
            "teleport",
            "example.com",
            80,
        );

        let label = allocator.label_for("Alice_Smith");
        assert!(label.starts_with("teleport-alice-smith-"), "{}", label);
        let suffix = label.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_labels_are_distinct() {
        let allocator = SubdomainAllocator::new(
            Arc::new(RecordingRouter::default()),
            "teleport",
            "example.com",
            80,
        );
        let labels: HashSet<_> = (0..1000).map(|_| allocator.label_for("bob")).collect();
        assert_eq!(labels.len(), 1000);
    }

    #[test]
    fn test_long_or_symbolic_identity() {
        let allocator = SubdomainAllocator::new(
            Arc::new(RecordingRouter::default()),
            "",
            "example.com",
            80,
        );

        let label = allocator.label_for(&"x".repeat(100));
        assert_eq!(label.len(), MAX_IDENTITY_LEN + 1 + SUFFIX_LEN);

        let label = allocator.label_for("@@@");
        assert_eq!(label.len(), SUFFIX_LEN);
    }

    #[test]
    fn test_public_host_trims_default_port() {
        let router = Arc::new(RecordingRouter::default());
        let http = SubdomainAllocator::new(router.clone(), "t", "example.com", 80);
        assert_eq!(http.public_host("abc"), "abc.example.com");

        let custom = SubdomainAllocator::new(router.clone(), "t", "localhost", 8080);
        assert_eq!(custom.public_host("abc"), "abc.localhost:8080");

        let odd_port = SubdomainAllocator::new(router, "t", "localhost", 180);
        assert_eq!(odd_port.public_host("abc"), "abc.localhost:180");
    }

    #[test]
    fn test_allocate_registers_with_router() {
        let router = Arc::new(RecordingRouter::default());
        let allocator = SubdomainAllocator::new(router.clone(), "teleport", "localhost", 8080);

        let allocation = allocator.allocate("carol").unwrap();
        assert!(allocation.public_host.ends_with(".localhost:8080"));
        assert_eq!(allocation.listener.host(), allocation.public_host);
        assert_eq!(
            router.requested.lock().unwrap().as_slice(),
            &[allocation.public_host.clone()]
        );
    }

    #[test]
    fn test_collision_is_allocation_failure() {
        let router = Arc::new(RecordingRouter {
            requested: Mutex::new(Vec::new()),
            taken: ["teleport-dave-".to_string()].into_iter().collect(),
        });
        let allocator = SubdomainAllocator::new(router, "teleport", "localhost", 8080);

        assert!(matches!(
            allocator.allocate("dave"),
            Err(AllocationError::Route {
                source: RouteError::RouteAlreadyExists(_),
                ..
            })
        ));
    }

    #[test]
    fn test_allocation_route_released_with_listener() {
        let registry = Arc::new(RouteRegistry::new());
        let allocator = SubdomainAllocator::new(registry.clone(), "teleport", "localhost", 8080);

        let allocation = allocator.allocate("erin").unwrap();
        assert!(registry.contains(&allocation.public_host));

        drop(allocation);
        assert!(registry.is_empty());
    }
}
