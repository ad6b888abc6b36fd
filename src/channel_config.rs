//! Per-client channel settings with global-then-default fallback resolution.

use std::collections::HashMap;
use std::time::Duration;

use tonic::transport::ClientTlsConfig;

const DEFAULT_LOAD_BALANCING_POLICY: &str = "round_robin";
const DEFAULT_KEEP_ALIVE_TIME: Duration = Duration::from_secs(5 * 60);
const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_SHUTDOWN_GRACE_PERIOD: GracePeriod = GracePeriod::Bounded(Duration::from_secs(30));

/// The scheme applied to targets that do not carry one of their own.
pub const DEFAULT_SCHEME: &str = "dns";

/// How a channel negotiates its transport security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationType {
    /// TLS, the default.
    #[default]
    Tls,
    /// Cleartext http/2.
    Plaintext,
}

/// Maximum time a channel is given to terminate voluntarily during
/// [`ChannelPool::close`](crate::ChannelPool::close) before it is forcefully
/// shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracePeriod {
    /// Wait at most this long.
    Bounded(Duration),
    /// Wait as long as the overall close budget allows.
    Unbounded,
}

/// Settings for a single named channel. Every field is optional; an unset
/// field inherits the global value and, failing that, a hardcoded default.
#[derive(Debug, Clone, Default)]
pub struct ChannelSettings {
    /// Target address uri, e.g. `static://10.0.0.1:9090` or
    /// `discovery:///my-service`. Falls back to the client name under the
    /// configured default scheme.
    pub address: Option<String>,
    /// Load-balancing policy name delegated to the transport, for
    /// [`ChannelBuilder`](crate::ChannelBuilder) implementations that honor
    /// one. The tonic-backed builder ignores it: tonic's balanced channel
    /// picks its endpoints with a fixed power-of-two-choices strategy.
    pub default_load_balancing_policy: Option<String>,
    /// Whether http/2 keepalive pings are sent.
    pub enable_keep_alive: Option<bool>,
    /// Delay before sending a keepalive ping.
    pub keep_alive_time: Option<Duration>,
    /// How long to wait for a keepalive ping acknowledgement.
    pub keep_alive_timeout: Option<Duration>,
    /// Whether keepalive pings are sent on idle connections.
    pub keep_alive_without_calls: Option<bool>,
    /// Maximum inbound message size in bytes.
    pub max_inbound_message_size: Option<usize>,
    /// Maximum inbound metadata size in bytes.
    pub max_inbound_metadata_size: Option<usize>,
    /// Transport security negotiation mode.
    pub negotiation_type: Option<NegotiationType>,
    /// TLS client configuration used when negotiating TLS.
    pub tls: Option<ClientTlsConfig>,
    /// Timeout applied to every request on the channel.
    pub request_timeout: Option<Duration>,
    /// Timeout applied to every connection attempt.
    pub connect_timeout: Option<Duration>,
    /// When set, channel construction blocks until the channel is ready or
    /// the timeout elapses. Unset means lazy connection establishment.
    pub immediate_connect_timeout: Option<Duration>,
    /// Grace period granted during pool shutdown.
    pub shutdown_grace_period: Option<GracePeriod>,
}

impl ChannelSettings {
    /// Fills every unset field from `defaults`.
    fn with_defaults_from(mut self, defaults: &ChannelSettings) -> Self {
        self.address = self.address.or_else(|| defaults.address.clone());
        self.default_load_balancing_policy = self
            .default_load_balancing_policy
            .or_else(|| defaults.default_load_balancing_policy.clone());
        self.enable_keep_alive = self.enable_keep_alive.or(defaults.enable_keep_alive);
        self.keep_alive_time = self.keep_alive_time.or(defaults.keep_alive_time);
        self.keep_alive_timeout = self.keep_alive_timeout.or(defaults.keep_alive_timeout);
        self.keep_alive_without_calls = self
            .keep_alive_without_calls
            .or(defaults.keep_alive_without_calls);
        self.max_inbound_message_size = self
            .max_inbound_message_size
            .or(defaults.max_inbound_message_size);
        self.max_inbound_metadata_size = self
            .max_inbound_metadata_size
            .or(defaults.max_inbound_metadata_size);
        self.negotiation_type = self.negotiation_type.or(defaults.negotiation_type);
        self.tls = self.tls.or_else(|| defaults.tls.clone());
        self.request_timeout = self.request_timeout.or(defaults.request_timeout);
        self.connect_timeout = self.connect_timeout.or(defaults.connect_timeout);
        self.immediate_connect_timeout = self
            .immediate_connect_timeout
            .or(defaults.immediate_connect_timeout);
        self.shutdown_grace_period = self.shutdown_grace_period.or(defaults.shutdown_grace_period);
        self
    }
}

/// Fully resolved settings for one channel, produced by
/// [`ChannelsConfig::channel`].
#[derive(Debug, Clone)]
pub struct ResolvedChannelSettings {
    /// Explicitly configured target address, if any.
    pub address: Option<String>,
    /// Policy name for builders that honor one; see
    /// [`ChannelSettings::default_load_balancing_policy`].
    pub default_load_balancing_policy: String,
    pub enable_keep_alive: bool,
    pub keep_alive_time: Duration,
    pub keep_alive_timeout: Duration,
    pub keep_alive_without_calls: bool,
    pub max_inbound_message_size: Option<usize>,
    pub max_inbound_metadata_size: Option<usize>,
    pub negotiation_type: NegotiationType,
    pub tls: Option<ClientTlsConfig>,
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub immediate_connect_timeout: Option<Duration>,
    pub shutdown_grace_period: GracePeriod,
}

/// Configuration for all channels of a pool: per-client settings, global
/// fallbacks and the default target scheme.
#[derive(Debug, Clone)]
pub struct ChannelsConfig {
    /// Fallback values for fields unset on a client.
    pub global: ChannelSettings,
    /// Per-client settings, keyed by client name.
    pub clients: HashMap<String, ChannelSettings>,
    /// Scheme applied to addresses (and bare client names) without one.
    pub default_scheme: String,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            global: ChannelSettings::default(),
            clients: HashMap::new(),
            default_scheme: DEFAULT_SCHEME.to_string(),
        }
    }
}

impl ChannelsConfig {
    /// Resolves the settings for the given client name: per-client over
    /// global over hardcoded defaults.
    pub fn channel(&self, name: &str) -> ResolvedChannelSettings {
        let merged = self
            .clients
            .get(name)
            .cloned()
            .unwrap_or_default()
            .with_defaults_from(&self.global);

        ResolvedChannelSettings {
            address: merged.address,
            default_load_balancing_policy: merged
                .default_load_balancing_policy
                .unwrap_or_else(|| DEFAULT_LOAD_BALANCING_POLICY.to_string()),
            enable_keep_alive: merged.enable_keep_alive.unwrap_or(false),
            keep_alive_time: merged.keep_alive_time.unwrap_or(DEFAULT_KEEP_ALIVE_TIME),
            keep_alive_timeout: merged
                .keep_alive_timeout
                .unwrap_or(DEFAULT_KEEP_ALIVE_TIMEOUT),
            keep_alive_without_calls: merged.keep_alive_without_calls.unwrap_or(false),
            max_inbound_message_size: merged.max_inbound_message_size,
            max_inbound_metadata_size: merged.max_inbound_metadata_size,
            negotiation_type: merged.negotiation_type.unwrap_or_default(),
            tls: merged.tls,
            request_timeout: merged.request_timeout,
            connect_timeout: merged.connect_timeout,
            immediate_connect_timeout: merged.immediate_connect_timeout,
            shutdown_grace_period: merged
                .shutdown_grace_period
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_PERIOD),
        }
    }
}
