//! A tonic channel that follows service resolution: every completed lookup
//! cycle is diffed into endpoint insertions and removals on a load-balanced
//! [`Channel`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, OnceCell};
use tonic::body::BoxBody;
use tonic::client::GrpcService;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tower::discover::Change;
use tower::Service;

use crate::channel_config::{NegotiationType, ResolvedChannelSettings};
use crate::channel_pool::{
    await_state, ChannelBuilder, ConnectivityState, ManagedChannel, PoolError,
};
use crate::dns_resolver::DnsResolver;
use crate::lock;
use crate::lookup_service::LookupService;
use crate::resolution_cache::{Listener, ResolutionCache, ResolveError, ResolverHandle};
use crate::target::{Target, DISCOVERY_SCHEME, DNS_SCHEME};

/// Size of the queue feeding endpoint changes into the load-balanced channel.
///
/// If a lookup cycle produces more changes than fit, the overflow is dropped
/// and picked up again by a later cycle's diff, so the queue only has to
/// absorb bursts.
const REPORT_ENDPOINTS_CHANNEL_SIZE: usize = 1024;

/// Builds [`GrpcChannel`]s whose endpoint set is kept fresh by a
/// [`ResolutionCache`].
///
/// The `discovery` scheme resolves through the lookup source the builder was
/// created with; the `dns` scheme resolves through a lazily initialized
/// system-configured [`DnsResolver`]. Both caches are shared across every
/// channel the builder produces, so two channels watching the same name share
/// lookups too.
pub struct GrpcChannelBuilder {
    discovery: ResolutionCache,
    dns: OnceCell<ResolutionCache>,
}

impl GrpcChannelBuilder {
    /// Creates a builder whose `discovery` targets resolve through `lookup`.
    pub fn new(lookup: Arc<dyn LookupService>) -> Self {
        Self {
            discovery: ResolutionCache::new(lookup),
            dns: OnceCell::new(),
        }
    }

    /// The cache backing `discovery` targets, e.g. to trigger a
    /// [`refresh`](ResolutionCache::refresh) from the outside.
    pub fn discovery_cache(&self) -> &ResolutionCache {
        &self.discovery
    }

    async fn cache_for(&self, name: &str, scheme: &str) -> Result<ResolutionCache, PoolError> {
        match scheme {
            DISCOVERY_SCHEME => Ok(self.discovery.clone()),
            DNS_SCHEME => self
                .dns
                .get_or_try_init(|| async {
                    let dns = DnsResolver::from_system_config().await.map_err(|err| {
                        PoolError::Configuration {
                            name: name.to_string(),
                            reason: format!("failed to initialize dns resolution: {err:#}"),
                        }
                    })?;
                    Ok(ResolutionCache::with_source(dns))
                })
                .await
                .cloned(),
            other => Err(PoolError::Configuration {
                name: name.to_string(),
                reason: format!("no resolver registered for scheme `{other}`"),
            }),
        }
    }
}

#[async_trait]
impl ChannelBuilder for GrpcChannelBuilder {
    type Channel = GrpcChannel;

    async fn build(
        &self,
        name: &str,
        target: &Target,
        settings: &ResolvedChannelSettings,
    ) -> Result<GrpcChannel, PoolError> {
        check_security(name, settings)?;
        let template = EndpointTemplate::new(target, settings);

        let (channel, reporter) = Channel::balance_channel::<SocketAddr>(REPORT_ENDPOINTS_CHANNEL_SIZE);
        let state = Arc::new(watch::channel(ConnectivityState::Idle).0);

        let resolver = match target {
            Target::Static(addresses) => {
                for address in addresses {
                    let endpoint =
                        template
                            .endpoint(*address)
                            .map_err(|reason| PoolError::Configuration {
                                name: name.to_string(),
                                reason,
                            })?;
                    if reporter.send(Change::Insert(*address, endpoint)).await.is_err() {
                        return Err(PoolError::Configuration {
                            name: name.to_string(),
                            reason: "load-balanced channel closed during setup".to_string(),
                        });
                    }
                }
                state.send_replace(ConnectivityState::Ready);
                None
            }
            Target::Resolvable { scheme, service } => {
                let cache = self.cache_for(name, scheme).await?;
                state.send_replace(ConnectivityState::Connecting);
                let listener = EndpointReporter {
                    name: name.to_string(),
                    template,
                    reporter,
                    state: Arc::clone(&state),
                    known: Mutex::new(HashSet::new()),
                };
                Some(cache.watch(service, Arc::new(listener)))
            }
        };

        Ok(GrpcChannel {
            name: name.to_string(),
            channel,
            state,
            resolver,
            max_inbound_message_size: settings.max_inbound_message_size,
            max_inbound_metadata_size: settings.max_inbound_metadata_size,
        })
    }
}

fn check_security(name: &str, settings: &ResolvedChannelSettings) -> Result<(), PoolError> {
    if settings.negotiation_type == NegotiationType::Plaintext && settings.tls.is_some() {
        return Err(PoolError::Configuration {
            name: name.to_string(),
            reason: "plaintext negotiation conflicts with the configured tls settings".to_string(),
        });
    }
    Ok(())
}

/// Everything needed to turn a bare socket address into a tonic [`Endpoint`]
/// carrying the channel's configured transport options.
struct EndpointTemplate {
    scheme: &'static str,
    tls: Option<ClientTlsConfig>,
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    keep_alive: Option<(Duration, Duration, bool)>,
}

impl EndpointTemplate {
    fn new(target: &Target, settings: &ResolvedChannelSettings) -> Self {
        let tls = match settings.negotiation_type {
            NegotiationType::Plaintext => None,
            NegotiationType::Tls => {
                let tls = settings.tls.clone().unwrap_or_default();
                // Endpoints are dialed by IP, so the hostname to present for
                // the TLS session has to be carried over from the resolved
                // service name.
                match target {
                    Target::Resolvable { service, .. } => {
                        let host = service.rsplit_once(':').map_or(service.as_str(), |(h, _)| h);
                        Some(tls.domain_name(host))
                    }
                    Target::Static(_) => Some(tls),
                }
            }
        };
        Self {
            scheme: match settings.negotiation_type {
                NegotiationType::Tls => "https",
                NegotiationType::Plaintext => "http",
            },
            tls,
            request_timeout: settings.request_timeout,
            connect_timeout: settings.connect_timeout,
            keep_alive: settings.enable_keep_alive.then_some((
                settings.keep_alive_time,
                settings.keep_alive_timeout,
                settings.keep_alive_without_calls,
            )),
        }
    }

    fn endpoint(&self, address: SocketAddr) -> Result<Endpoint, String> {
        let mut endpoint = Endpoint::from_shared(format!("{}://{address}", self.scheme))
            .map_err(|err| format!("invalid endpoint uri for {address}: {err}"))?;
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|err| format!("invalid tls configuration: {err}"))?;
        }
        if let Some(timeout) = self.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some((interval, timeout, while_idle)) = self.keep_alive {
            endpoint = endpoint
                .http2_keep_alive_interval(interval)
                .keep_alive_timeout(timeout)
                .keep_alive_while_idle(while_idle);
        }
        Ok(endpoint)
    }
}

/// Listener that turns resolution results into endpoint changes on the
/// load-balanced channel.
struct EndpointReporter {
    name: String,
    template: EndpointTemplate,
    reporter: mpsc::Sender<Change<SocketAddr, Endpoint>>,
    state: Arc<watch::Sender<ConnectivityState>>,
    /// The addresses currently reported to the channel; the next cycle is
    /// diffed against this set.
    known: Mutex<HashSet<SocketAddr>>,
}

impl EndpointReporter {
    fn report(&self, change: Change<SocketAddr, Endpoint>) -> bool {
        match self.reporter.try_send(change) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Dropped changes are recovered by the diff of a later cycle.
                tracing::error!("endpoint change queue for `{}` is full", self.name);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl Listener for EndpointReporter {
    fn on_result(&self, addresses: &[SocketAddr]) {
        if *self.state.borrow() == ConnectivityState::Shutdown {
            return;
        }
        let fresh: HashSet<SocketAddr> = addresses.iter().copied().collect();
        let mut known = lock(&self.known);
        let removed: Vec<SocketAddr> = known.difference(&fresh).copied().collect();
        let added: Vec<SocketAddr> = fresh.difference(&known).copied().collect();

        for address in removed {
            tracing::debug!("removing `{address}` from the endpoints of `{}`", self.name);
            if self.report(Change::Remove(address)) {
                known.remove(&address);
            }
        }
        for address in added {
            match self.template.endpoint(address) {
                Ok(endpoint) => {
                    tracing::debug!("adding `{address}` to the endpoints of `{}`", self.name);
                    if self.report(Change::Insert(address, endpoint)) {
                        known.insert(address);
                    }
                }
                Err(reason) => {
                    tracing::error!("skipping endpoint for `{}`: {reason}", self.name);
                }
            }
        }

        if !known.is_empty() {
            self.state.send_if_modified(|state| {
                if *state == ConnectivityState::Ready {
                    false
                } else {
                    *state = ConnectivityState::Ready;
                    true
                }
            });
        }
    }

    fn on_error(&self, error: &ResolveError) {
        if *self.state.borrow() == ConnectivityState::Shutdown {
            return;
        }
        tracing::warn!("resolution for `{}` failed: {error}", self.name);
        // Previously reported endpoints stay in rotation; only a channel that
        // never had any is marked failing.
        if lock(&self.known).is_empty() {
            self.state.send_replace(ConnectivityState::TransientFailure);
        }
    }
}

/// A pooled gRPC channel: a load-balanced tonic [`Channel`] plus the
/// resolution watch that keeps its endpoints fresh.
pub struct GrpcChannel {
    name: String,
    channel: Channel,
    state: Arc<watch::Sender<ConnectivityState>>,
    resolver: Option<ResolverHandle>,
    max_inbound_message_size: Option<usize>,
    max_inbound_metadata_size: Option<usize>,
}

impl GrpcChannel {
    /// The client name this channel was built for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A cheap clone of the underlying channel, suitable for handing to a
    /// generated client stub.
    pub fn channel(&self) -> LoadBalancedChannel {
        LoadBalancedChannel(self.channel.clone())
    }

    /// Configured maximum inbound message size, to be applied on the stub.
    pub fn max_inbound_message_size(&self) -> Option<usize> {
        self.max_inbound_message_size
    }

    /// Configured maximum inbound metadata size, to be applied on the stub.
    pub fn max_inbound_metadata_size(&self) -> Option<usize> {
        self.max_inbound_metadata_size
    }

    fn terminate(&self) {
        if let Some(resolver) = &self.resolver {
            resolver.shutdown();
        }
        self.state.send_replace(ConnectivityState::Shutdown);
    }
}

#[async_trait]
impl ManagedChannel for GrpcChannel {
    fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    fn shutdown(&self) {
        // tonic drains in-flight calls on drop; detaching the resolution
        // watch is all the teardown this channel needs.
        self.terminate();
    }

    fn shutdown_now(&self) {
        self.terminate();
    }

    fn is_terminated(&self) -> bool {
        self.state() == ConnectivityState::Shutdown
    }

    async fn await_termination(&self, timeout: Duration) -> bool {
        await_state(self.state.subscribe(), ConnectivityState::Shutdown, timeout).await
    }
}

/// A wrapper around tonic's [`Channel`] whose endpoint set follows service
/// resolution. Implements [`Service`] so it can be used directly by generated
/// client stubs.
#[derive(Debug, Clone)]
pub struct LoadBalancedChannel(Channel);

impl From<LoadBalancedChannel> for Channel {
    fn from(channel: LoadBalancedChannel) -> Self {
        channel.0
    }
}

impl Service<http::Request<BoxBody>> for LoadBalancedChannel {
    type Response = http::Response<<Channel as GrpcService<BoxBody>>::ResponseBody>;
    type Error = <Channel as GrpcService<BoxBody>>::Error;
    type Future = <Channel as GrpcService<BoxBody>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        GrpcService::poll_ready(&mut self.0, cx)
    }

    fn call(&mut self, request: http::Request<BoxBody>) -> Self::Future {
        GrpcService::call(&mut self.0, request)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel_config::ChannelsConfig;

    fn plaintext_settings() -> ResolvedChannelSettings {
        let mut config = ChannelsConfig::default();
        config.global.negotiation_type = Some(NegotiationType::Plaintext);
        config.channel("svc")
    }

    struct FixedLookup(Vec<SocketAddr>);

    #[async_trait]
    impl LookupService for FixedLookup {
        async fn resolve(&self, _service: &str) -> Result<Vec<SocketAddr>, anyhow::Error> {
            Ok(self.0.clone())
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 50051))
    }

    fn reporter_with_queue() -> (EndpointReporter, mpsc::Receiver<Change<SocketAddr, Endpoint>>) {
        let (tx, rx) = mpsc::channel(16);
        let reporter = EndpointReporter {
            name: "svc".to_string(),
            template: EndpointTemplate::new(
                &Target::Resolvable {
                    scheme: "discovery".to_string(),
                    service: "svc".to_string(),
                },
                &plaintext_settings(),
            ),
            reporter: tx,
            state: Arc::new(watch::channel(ConnectivityState::Connecting).0),
            known: Mutex::new(HashSet::new()),
        };
        (reporter, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Change<SocketAddr, Endpoint>>) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
        let mut inserted = Vec::new();
        let mut removed = Vec::new();
        while let Ok(change) = rx.try_recv() {
            match change {
                Change::Insert(address, _) => inserted.push(address),
                Change::Remove(address) => removed.push(address),
            }
        }
        inserted.sort();
        removed.sort();
        (inserted, removed)
    }

    #[tokio::test]
    async fn reporter_diffs_consecutive_address_sets() {
        let (reporter, mut rx) = reporter_with_queue();

        reporter.on_result(&[addr(1), addr(2)]);
        let (inserted, removed) = drain(&mut rx);
        assert_eq!(inserted, vec![addr(1), addr(2)]);
        assert!(removed.is_empty());
        assert_eq!(*reporter.state.borrow(), ConnectivityState::Ready);

        reporter.on_result(&[addr(2), addr(3)]);
        let (inserted, removed) = drain(&mut rx);
        assert_eq!(inserted, vec![addr(3)]);
        assert_eq!(removed, vec![addr(1)]);
    }

    #[tokio::test]
    async fn unchanged_address_set_reports_nothing() {
        let (reporter, mut rx) = reporter_with_queue();

        reporter.on_result(&[addr(1)]);
        drain(&mut rx);
        reporter.on_result(&[addr(1)]);
        let (inserted, removed) = drain(&mut rx);
        assert!(inserted.is_empty());
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn resolution_error_without_endpoints_marks_the_channel_failing() {
        let (reporter, _rx) = reporter_with_queue();
        reporter.on_error(&ResolveError::NoAddresses("svc".to_string()));
        assert_eq!(*reporter.state.borrow(), ConnectivityState::TransientFailure);
    }

    #[tokio::test]
    async fn resolution_error_keeps_previously_reported_endpoints() {
        let (reporter, mut rx) = reporter_with_queue();
        reporter.on_result(&[addr(1)]);
        drain(&mut rx);

        reporter.on_error(&ResolveError::LookupFailed {
            service: "svc".to_string(),
            cause: "registry is down".to_string(),
        });
        assert_eq!(*reporter.state.borrow(), ConnectivityState::Ready);
        let (inserted, removed) = drain(&mut rx);
        assert!(inserted.is_empty());
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn plaintext_with_tls_settings_is_rejected() {
        let mut settings = plaintext_settings();
        settings.tls = Some(ClientTlsConfig::new());
        let builder = GrpcChannelBuilder::new(Arc::new(FixedLookup(vec![])));
        let result = builder
            .build("svc", &Target::Static(vec![addr(1)]), &settings)
            .await;
        assert!(matches!(result, Err(PoolError::Configuration { .. })));
    }

    #[tokio::test]
    async fn static_target_is_ready_immediately() {
        let builder = GrpcChannelBuilder::new(Arc::new(FixedLookup(vec![])));
        let channel = builder
            .build(
                "svc",
                &Target::Static(vec![addr(1), addr(2)]),
                &plaintext_settings(),
            )
            .await
            .unwrap();
        assert_eq!(channel.state(), ConnectivityState::Ready);

        channel.shutdown();
        assert!(channel.is_terminated());
        assert!(channel.await_termination(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn resolvable_target_becomes_ready_after_the_first_lookup() {
        let builder = GrpcChannelBuilder::new(Arc::new(FixedLookup(vec![addr(1)])));
        let channel = builder
            .build(
                "svc",
                &Target::Resolvable {
                    scheme: "discovery".to_string(),
                    service: "svc".to_string(),
                },
                &plaintext_settings(),
            )
            .await
            .unwrap();

        assert!(
            await_state(
                channel.watch_state(),
                ConnectivityState::Ready,
                Duration::from_secs(2),
            )
            .await
        );

        channel.shutdown();
        assert!(channel.is_terminated());
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let builder = GrpcChannelBuilder::new(Arc::new(FixedLookup(vec![])));
        let result = builder
            .build(
                "svc",
                &Target::Resolvable {
                    scheme: "xds".to_string(),
                    service: "svc".to_string(),
                },
                &plaintext_settings(),
            )
            .await;
        match result {
            Err(PoolError::Configuration { reason, .. }) => assert!(reason.contains("xds")),
            Err(err) => panic!("expected configuration error, got {err:?}"),
            Ok(_) => panic!("expected configuration error, got a channel"),
        }
    }
}
