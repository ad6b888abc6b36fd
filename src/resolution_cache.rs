//! A service-resolution cache with single-flight lookups,
//! stale-while-revalidate delivery and fanout to every active watcher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::{lock, LookupService};

/// Receives resolution results for a watched service name.
///
/// Callbacks are invoked while the per-name cache entry is locked:
/// implementations must return promptly and must not call back into the
/// [`ResolutionCache`], or delivery to other watchers of the same name will
/// stall. Watchers of unrelated names are never affected.
pub trait Listener: Send + Sync + 'static {
    /// Called with the full address set produced by a completed lookup cycle.
    fn on_result(&self, addresses: &[SocketAddr]);

    /// Called when a lookup cycle failed or resolved to no addresses.
    fn on_error(&self, error: &ResolveError);
}

/// Terminal failure of a single lookup cycle.
///
/// Resolution errors are never returned from [`ResolutionCache::watch`]; they
/// reach watchers through [`Listener::on_error`] and are retried on the next
/// `watch` or `refresh` trigger.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// The lookup succeeded but returned no endpoints.
    #[error("service `{0}` resolved to no addresses")]
    NoAddresses(String),
    /// The lookup itself failed.
    #[error("lookup for service `{service}` failed: {cause}")]
    LookupFailed {
        /// The service name the lookup was for.
        service: String,
        /// Rendered cause of the underlying lookup failure.
        cause: String,
    },
}

type Outcome = Result<Vec<SocketAddr>, ResolveError>;

#[derive(Default)]
struct EntryState {
    /// Value of the most recently completed cycle. Either addresses or an
    /// error, never both.
    last: Option<Outcome>,
    /// True while a lookup for this name is outstanding.
    refreshing: bool,
    /// Set by [`ResolutionCache::teardown`]; a defunct entry completes its
    /// in-flight cycle without delivering.
    defunct: bool,
    next_subscriber: u64,
    subscribers: HashMap<u64, Arc<dyn Listener>>,
}

#[derive(Default)]
struct CacheEntry {
    state: Mutex<EntryState>,
}

struct CacheShared {
    lookup: Arc<dyn LookupService>,
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

/// Caches the last known endpoint list (or error) per service name,
/// deduplicates concurrent lookups and fans every completed lookup out to all
/// active watchers of that name.
///
/// New watchers are served the cached value immediately while a revalidation
/// proceeds in the background, so a watcher never blocks on a network round
/// trip when a previous resolution exists. At most one lookup per name is in
/// flight at any time; entries for unrelated names never contend.
#[derive(Clone)]
pub struct ResolutionCache {
    shared: Arc<CacheShared>,
}

impl ResolutionCache {
    /// Creates a cache backed by the given lookup source.
    pub fn new(lookup: Arc<dyn LookupService>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                lookup,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a cache backed by the given lookup source.
    pub fn with_source<L: LookupService + 'static>(lookup: L) -> Self {
        Self::new(Arc::new(lookup))
    }

    /// Registers `listener` against `service`.
    ///
    /// If a previous resolution for `service` exists, its value is delivered
    /// to `listener` synchronously before this function returns. A
    /// revalidation is then started unless one is already in flight, in which
    /// case the listener simply receives that lookup's result together with
    /// every other watcher of the name.
    ///
    /// A watch always succeeds; failures belong to the asynchronous
    /// resolution path and arrive through the listener.
    #[tracing::instrument(level = "debug", skip(self, listener))]
    pub fn watch(&self, service: &str, listener: Arc<dyn Listener>) -> ResolverHandle {
        let entry = self.entry(service);

        // Serve stale before the listener can observe a fresher cycle.
        let stale = lock(&entry.state).last.clone();
        if let Some(outcome) = &stale {
            deliver(&listener, outcome);
        }

        let id = {
            let mut state = lock(&entry.state);
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.insert(id, listener);
            if !state.refreshing && !state.defunct {
                state.refreshing = true;
                self.spawn_lookup(service, Arc::clone(&entry));
            }
            id
        };

        ResolverHandle {
            service: service.to_string(),
            id,
            entry: Arc::downgrade(&entry),
            active: AtomicBool::new(true),
        }
    }

    /// Triggers a revalidation for `service` without registering a listener,
    /// e.g. for operator-triggered cache busting.
    ///
    /// If a lookup for the name is already in flight this is a no-op join,
    /// not a duplicate lookup. With `force` set, an entry is created (and a
    /// lookup performed) even for a name nobody has ever watched; otherwise
    /// unknown names are ignored.
    pub fn refresh(&self, service: &str, force: bool) {
        let entry = if force {
            Some(self.entry(service))
        } else {
            lock(&self.shared.entries).get(service).cloned()
        };
        let Some(entry) = entry else {
            return;
        };
        let mut state = lock(&entry.state);
        if !state.refreshing && !state.defunct {
            state.refreshing = true;
            self.spawn_lookup(service, Arc::clone(&entry));
        }
    }

    /// Clears all entries and subscriber sets. In-flight lookups complete
    /// without delivering. Used only at process shutdown.
    pub fn teardown(&self) {
        let entries: Vec<Arc<CacheEntry>> = {
            let mut map = lock(&self.shared.entries);
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let mut state = lock(&entry.state);
            state.defunct = true;
            state.subscribers.clear();
            state.last = None;
        }
        tracing::debug!("resolution cache torn down");
    }

    fn entry(&self, service: &str) -> Arc<CacheEntry> {
        Arc::clone(
            lock(&self.shared.entries)
                .entry(service.to_string())
                .or_default(),
        )
    }

    /// Runs one lookup cycle. The caller must have set `refreshing` on the
    /// entry; this task is the only writer until it clears the flag again.
    fn spawn_lookup(&self, service: &str, entry: Arc<CacheEntry>) {
        let lookup = Arc::clone(&self.shared.lookup);
        let service = service.to_string();
        tokio::spawn(async move {
            tracing::debug!("starting lookup cycle for {service}");
            let outcome: Outcome = match lookup.resolve(&service).await {
                Ok(addresses) if !addresses.is_empty() => Ok(addresses),
                Ok(_) => {
                    tracing::error!("no servers found for {service}");
                    Err(ResolveError::NoAddresses(service.clone()))
                }
                Err(cause) => {
                    tracing::error!("failed to update server list for {service}: {cause:#}");
                    Err(ResolveError::LookupFailed {
                        service: service.clone(),
                        cause: format!("{cause:#}"),
                    })
                }
            };

            let mut state = lock(&entry.state);
            if state.defunct {
                state.refreshing = false;
                return;
            }
            state.last = Some(outcome.clone());
            // Delivery happens before `refreshing` is cleared, so two cycles
            // for the same name never interleave from a subscriber's point of
            // view. The subscriber set is read at completion time: a watcher
            // that joined mid-cycle still receives this result.
            for listener in state.subscribers.values() {
                deliver(listener, &outcome);
            }
            state.refreshing = false;
            tracing::debug!("done updating server list for {service}");
        });
    }
}

fn deliver(listener: &Arc<dyn Listener>, outcome: &Outcome) {
    match outcome {
        Ok(addresses) => listener.on_result(addresses),
        Err(error) => listener.on_error(error),
    }
}

/// One logical watch on a service name, returned by
/// [`ResolutionCache::watch`].
///
/// Dropping the handle shuts it down.
pub struct ResolverHandle {
    service: String,
    id: u64,
    entry: Weak<CacheEntry>,
    active: AtomicBool,
}

impl ResolverHandle {
    /// The service name this handle watches.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether the handle still receives callbacks.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Detaches the handle's listener. Idempotent. Does not cancel an
    /// in-flight lookup and does not affect other handles for the same name;
    /// once this returns, the listener will never be called again.
    pub fn shutdown(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(entry) = self.entry.upgrade() {
                lock(&entry.state).subscribers.remove(&self.id);
            }
            tracing::debug!("shut down resolver for {}", self.service);
        }
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
