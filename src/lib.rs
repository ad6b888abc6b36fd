//! `sorbo` turns a logical service name into a live, load-balanced gRPC
//! channel built on tonic, keeps the channel's address list fresh as the
//! backing service topology changes, and manages connection lifecycle up to
//! and including a time-bounded graceful shutdown.
//!
//! The crate is built from two cooperating pieces:
//!
//! - [`ResolutionCache`]: answers "which addresses currently back service X"
//!   with single-flight deduplicated lookups, immediate stale delivery to new
//!   watchers and fanout of every completed lookup to all active watchers.
//! - [`ChannelPool`]: owns one long-lived channel per logical client name,
//!   tracks its [`ConnectivityState`] and shuts every channel down within a
//!   bounded grace period.
//!
//! # Simple example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sorbo::{ChannelPool, ChannelsConfig, DnsResolver, GrpcChannelBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), anyhow::Error> {
//!     let lookup = Arc::new(DnsResolver::from_system_config().await?);
//!     let pool = ChannelPool::new(GrpcChannelBuilder::new(lookup), ChannelsConfig::default());
//!
//!     let channel = pool.get_or_create("my-service").await?;
//!     // Hand this to a generated client stub.
//!     let _stub_channel = channel.channel();
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
//!
//! The address lookup is pluggable: anything implementing [`LookupService`]
//! can back the `discovery` scheme, DNS being merely the default.
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use sorbo::{Listener, LookupService, ResolutionCache, ResolveError};
//!
//! struct FixedLookup(Vec<SocketAddr>);
//!
//! #[async_trait::async_trait]
//! impl LookupService for FixedLookup {
//!     async fn resolve(&self, _service: &str) -> Result<Vec<SocketAddr>, anyhow::Error> {
//!         Ok(self.0.clone())
//!     }
//! }
//!
//! struct PrintListener;
//!
//! impl Listener for PrintListener {
//!     fn on_result(&self, addresses: &[SocketAddr]) {
//!         println!("servers: {addresses:?}");
//!     }
//!     fn on_error(&self, error: &ResolveError) {
//!         eprintln!("resolution failed: {error}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = ResolutionCache::with_source(FixedLookup(vec![
//!         "127.0.0.1:50051".parse().expect("valid address"),
//!     ]));
//!     let handle = cache.watch("orders", Arc::new(PrintListener));
//!     // ... the listener now receives every completed lookup cycle ...
//!     handle.shutdown();
//! }
//! ```
//!
//! # Internals
//!
//! The tonic [`Channel`](tonic::transport::Channel) exposes
//! [`balance_channel`](tonic::transport::Channel::balance_channel), which
//! returns a bounded queue through which endpoint changes can be sent.
//! [`GrpcChannelBuilder`] wires a [`ResolutionCache`] watcher to that queue, so
//! every completed lookup cycle is diffed against the previously reported
//! address set and turned into endpoint insertions and removals.

mod balanced_channel;
mod channel_config;
mod channel_pool;
mod dns_resolver;
mod lookup_service;
mod resolution_cache;
mod target;

pub use balanced_channel::*;
pub use channel_config::*;
pub use channel_pool::*;
pub use dns_resolver::*;
pub use lookup_service::*;
pub use resolution_cache::*;
pub use target::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

// A poisoned lock only means a listener panicked while we held the guard;
// the protected maps are still structurally sound.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
