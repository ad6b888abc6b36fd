//! Pooled, state-tracked channels keyed by logical client name.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, OnceCell};

use crate::channel_config::{ChannelsConfig, GracePeriod, ResolvedChannelSettings};
use crate::lock;
use crate::target::Target;

/// Cap on the graceful wait for channels whose grace period is unbounded, in
/// case every channel asked to be awaited forever.
const UNBOUNDED_CLOSE_WAIT: Duration = Duration::from_secs(60);

/// Connectivity lifecycle stage of a managed channel.
///
/// Transitions are driven by the underlying transport; the pool only observes
/// and republishes them, except for [`Shutdown`](ConnectivityState::Shutdown)
/// which it forces during [`ChannelPool::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No connection attempt has been made yet.
    Idle,
    /// The channel is establishing a connection.
    Connecting,
    /// The channel can serve calls.
    Ready,
    /// The channel has seen a failure it expects to recover from.
    TransientFailure,
    /// The channel is terminated. Terminal.
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient-failure",
            ConnectivityState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// The connection object managed by a [`ChannelPool`].
///
/// The pool creates one per client name, republishes its connectivity state
/// and owns its shutdown.
#[async_trait]
pub trait ManagedChannel: Send + Sync + 'static {
    /// Current connectivity state.
    fn state(&self) -> ConnectivityState;

    /// A receiver that observes every state change.
    fn watch_state(&self) -> watch::Receiver<ConnectivityState>;

    /// Requests a graceful shutdown; in-flight calls may finish.
    fn shutdown(&self);

    /// Terminates immediately, abandoning in-flight calls.
    fn shutdown_now(&self);

    /// Whether the channel has fully terminated.
    fn is_terminated(&self) -> bool;

    /// Waits up to `timeout` for the channel to terminate and returns whether
    /// it did.
    async fn await_termination(&self, timeout: Duration) -> bool;
}

/// Builds a [`ManagedChannel`] for a client name from its parsed target and
/// resolved settings.
#[async_trait]
pub trait ChannelBuilder: Send + Sync + 'static {
    /// The channel type this builder produces.
    type Channel: ManagedChannel;

    /// Builds the channel. Configuration conflicts must fail fast here with
    /// [`PoolError::Configuration`].
    async fn build(
        &self,
        name: &str,
        target: &Target,
        settings: &ResolvedChannelSettings,
    ) -> Result<Self::Channel, PoolError>;
}

/// Failure of a [`ChannelPool`] operation.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has been closed; no further channels can be obtained.
    #[error("channel pool is already closed")]
    Closed,
    /// The settings for a channel are contradictory or unusable.
    #[error("invalid configuration for channel `{name}`: {reason}")]
    Configuration {
        /// The client name the channel was requested for.
        name: String,
        /// What is wrong with the configuration.
        reason: String,
    },
    /// The immediate-connect budget elapsed before the channel became ready.
    /// The background connection attempt is not aborted.
    #[error("channel `{name}` did not become ready within {timeout:?}")]
    ConnectTimeout {
        /// The client name the channel was requested for.
        name: String,
        /// The configured immediate-connect timeout.
        timeout: Duration,
    },
}

struct PoolEntry<C> {
    channel: Arc<C>,
    grace: GracePeriod,
    immediate_connect_timeout: Option<Duration>,
}

struct PoolMap<C> {
    closed: bool,
    entries: HashMap<String, Arc<OnceCell<PoolEntry<C>>>>,
}

struct PoolShared<C> {
    channels: Mutex<PoolMap<C>>,
    states: Mutex<HashMap<String, ConnectivityState>>,
}

/// Maps a logical client name to one pooled channel.
///
/// Channels are built lazily on first use from per-name configuration,
/// reused by all callers of that name and shut down within a bounded grace
/// period by [`close`](ChannelPool::close).
pub struct ChannelPool<B: ChannelBuilder> {
    builder: B,
    config: ChannelsConfig,
    shared: Arc<PoolShared<B::Channel>>,
}

impl<B: ChannelBuilder> ChannelPool<B> {
    /// Creates an empty pool.
    pub fn new(builder: B, config: ChannelsConfig) -> Self {
        Self {
            builder,
            config,
            shared: Arc::new(PoolShared {
                channels: Mutex::new(PoolMap {
                    closed: false,
                    entries: HashMap::new(),
                }),
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the pooled channel for `name`, building it on first use.
    ///
    /// Two concurrent calls for the same name construct exactly one channel;
    /// construction of unrelated names never contends. If an
    /// immediate-connect timeout is configured for the name, the call that
    /// builds the channel blocks until it is ready or fails with
    /// [`PoolError::ConnectTimeout`]. The timeout does not abort the
    /// connection attempt: the channel stays pooled, keeps connecting in the
    /// background and is returned as-is by later calls.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<B::Channel>, PoolError> {
        let cell = {
            let mut map = lock(&self.shared.channels);
            if map.closed {
                return Err(PoolError::Closed);
            }
            Arc::clone(map.entries.entry(name.to_string()).or_default())
        };

        let mut initialized = false;
        let entry = cell
            .get_or_try_init(|| {
                initialized = true;
                self.build_entry(name)
            })
            .await?;

        // close() may have run while this channel was still being built and
        // never saw it; it must not outlive the pool.
        if lock(&self.shared.channels).closed {
            entry.channel.shutdown_now();
            return Err(PoolError::Closed);
        }

        if initialized {
            if let Some(timeout) = entry.immediate_connect_timeout {
                tracing::debug!("waiting up to {timeout:?} for channel `{name}` to connect");
                if !await_state(entry.channel.watch_state(), ConnectivityState::Ready, timeout)
                    .await
                {
                    // Only the building call reports the miss; the channel is
                    // already pooled and continues connecting.
                    return Err(PoolError::ConnectTimeout {
                        name: name.to_string(),
                        timeout,
                    });
                }
                tracing::info!("successfully connected channel `{name}`");
            }
        }

        Ok(Arc::clone(&entry.channel))
    }

    async fn build_entry(&self, name: &str) -> Result<PoolEntry<B::Channel>, PoolError> {
        let settings = self.config.channel(name);
        let target = Target::parse(name, settings.address.as_deref(), &self.config.default_scheme)
            .map_err(|reason| PoolError::Configuration {
                name: name.to_string(),
                reason,
            })?;
        tracing::debug!("building channel `{name}` targeting {target}");

        let channel = Arc::new(self.builder.build(name, &target, &settings).await?);

        self.watch_connectivity(name, &channel);

        Ok(PoolEntry {
            channel,
            grace: settings.shutdown_grace_period,
            immediate_connect_timeout: settings.immediate_connect_timeout,
        })
    }

    /// Keeps the state snapshot current by re-observing the channel after
    /// every change, until the channel reaches its terminal state.
    fn watch_connectivity(&self, name: &str, channel: &Arc<B::Channel>) {
        let shared = Arc::clone(&self.shared);
        let name = name.to_string();
        let mut states = channel.watch_state();
        tokio::spawn(async move {
            loop {
                let state = *states.borrow();
                {
                    // Checked and inserted under the channels lock so a
                    // watcher woken by close() cannot repopulate the snapshot
                    // after close() has cleared it.
                    let map = lock(&shared.channels);
                    if map.closed {
                        break;
                    }
                    lock(&shared.states).insert(name.clone(), state);
                }
                if state == ConnectivityState::Shutdown {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// A snapshot of the current connectivity state of every pooled channel.
    pub fn connectivity_states(&self) -> HashMap<String, ConnectivityState> {
        lock(&self.shared.states).clone()
    }

    /// Closes the pool and every channel in it.
    ///
    /// A graceful shutdown is requested on all channels immediately. The
    /// channels are then awaited in ascending grace-period order against a
    /// shared elapsed budget and force-terminated if their remaining budget
    /// runs out, which bounds the total shutdown latency to the maximum
    /// configured grace period. Channels with an unbounded grace period are
    /// awaited last, with whatever budget remains. Idempotent.
    pub async fn close(&self) {
        let mut entries: Vec<(String, Arc<B::Channel>, GracePeriod)> = {
            let mut map = lock(&self.shared.channels);
            if map.closed {
                return;
            }
            map.closed = true;
            map.entries
                .drain()
                .filter_map(|(name, cell)| {
                    cell.get()
                        .map(|entry| (name, Arc::clone(&entry.channel), entry.grace))
                })
                .collect()
        };

        tracing::info!("closing channel pool ({} channels)", entries.len());
        for (name, channel, _) in &entries {
            tracing::debug!("requesting graceful shutdown of channel `{name}`");
            channel.shutdown();
        }

        entries.sort_by_key(|(_, _, grace)| match grace {
            GracePeriod::Bounded(duration) => *duration,
            GracePeriod::Unbounded => Duration::MAX,
        });
        let unbounded_budget = entries
            .iter()
            .filter_map(|(_, _, grace)| match grace {
                GracePeriod::Bounded(duration) => Some(*duration),
                GracePeriod::Unbounded => None,
            })
            .max()
            .unwrap_or(UNBOUNDED_CLOSE_WAIT);

        let start = Instant::now();
        for (name, channel, grace) in entries {
            let budget = match grace {
                GracePeriod::Bounded(duration) => duration,
                GracePeriod::Unbounded => unbounded_budget,
            };
            let remaining = budget.saturating_sub(start.elapsed());
            let terminated = if remaining.is_zero() {
                channel.is_terminated()
            } else {
                channel.await_termination(remaining).await
            };
            if !terminated {
                tracing::debug!("channel `{name}` not terminated in time, forcing shutdown");
                channel.shutdown_now();
            }
        }

        lock(&self.shared.states).clear();
        tracing::info!("channel pool closed");
    }
}

/// Waits until the receiver observes `wanted` or `timeout` elapses; returns
/// whether the state was reached.
pub(crate) async fn await_state(
    mut states: watch::Receiver<ConnectivityState>,
    wanted: ConnectivityState,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if *states.borrow() == wanted {
            return true;
        }
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            // Beyond representable time; treat as no deadline.
            None => Duration::MAX,
        };
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, states.changed()).await {
            Ok(Ok(())) => {}
            // The sender is gone; the state can never change again.
            Ok(Err(_)) => return *states.borrow() == wanted,
            Err(_) => return false,
        }
    }
}
