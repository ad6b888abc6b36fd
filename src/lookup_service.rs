//! Defines the interface that the [`ResolutionCache`](crate::ResolutionCache)
//! uses to look up the current endpoints of a service.

use std::net::SocketAddr;

/// Interface that provides the current set of network endpoints backing a
/// logical service name.
///
/// Implementations may be slow or unreliable; the cache never issues more
/// than one lookup per service name at a time, which gives implementations
/// natural backpressure.
#[async_trait::async_trait]
pub trait LookupService: Send + Sync {
    /// Returns the endpoints currently backing `service`.
    ///
    /// An empty list is treated by the cache the same as a failed lookup.
    async fn resolve(&self, service: &str) -> Result<Vec<SocketAddr>, anyhow::Error>;
}
