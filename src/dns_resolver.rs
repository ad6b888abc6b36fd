//! Implements [`LookupService`] for dns.

use crate::LookupService;
use anyhow::Context;
use hickory_resolver::{system_conf, TokioAsyncResolver};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Implements [`LookupService`] by resolving `host:port` service names with
/// DNS queries.
pub struct DnsResolver {
    /// The hickory resolver, which contacts the dns service directly such
    /// that we bypass os-specific dns caching.
    dns: TokioAsyncResolver,
}

impl DnsResolver {
    /// Construct a new [`DnsResolver`] from env and system configuration, e.g `resolv.conf`.
    pub async fn from_system_config() -> Result<Self, anyhow::Error> {
        let (config, mut opts) = system_conf::read_system_conf()
            .context("failed to read dns services from system configuration")?;

        // We do not want any caching on our side.
        opts.cache_size = 0;

        let dns = TokioAsyncResolver::tokio(config, opts);

        Ok(Self { dns })
    }
}

#[async_trait::async_trait]
impl LookupService for DnsResolver {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve(&self, service: &str) -> Result<Vec<SocketAddr>, anyhow::Error> {
        let (host, port) = split_host_port(service)?;
        match self.dns.lookup_ip(host).await {
            Ok(lookup) => {
                tracing::debug!("dns query expires in: {:?}", lookup.valid_until());
                let addresses: HashSet<SocketAddr> = lookup
                    .iter()
                    .map(|ip_addr| {
                        tracing::debug!("result: ip {}", ip_addr);
                        (ip_addr, port).into()
                    })
                    .collect();
                Ok(addresses.into_iter().collect())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Splits a `host:port` service name and validates the host part as a dns name.
fn split_host_port(service: &str) -> Result<(&str, u16), anyhow::Error> {
    let (host, port) = service
        .rsplit_once(':')
        .with_context(|| format!("service name `{service}` is missing a port"))?;

    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in service name `{service}`"))?;

    hickory_resolver::Name::from_ascii(host)
        .map_err(anyhow::Error::from)
        .context("invalid 'hostname'")?;

    Ok((host, port))
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prop_compose;

    #[test]
    fn splits_host_and_port() {
        let (host, port) = split_host_port("my.service.internal:5000").unwrap();
        assert_eq!(host, "my.service.internal");
        assert_eq!(port, 5000);
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(split_host_port("my.service.internal").is_err());
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        assert!(split_host_port("my.service.internal:grpc").is_err());
    }

    prop_compose! {
        fn valid_hostname()(s in "[a-z.0-9*A-Z]") -> String {
            s
        }
    }

    prop_compose! {
        fn invalid_hostname()(s in "[^\\a-z.0-9*A-Z]+") -> String {
            s
        }
    }

    proptest::proptest! {
        #[test]
        fn valid_hostname_shall_succeed(hostname in valid_hostname()) {
            let service = format!("{hostname}:5000");
            proptest::prop_assert!(split_host_port(&service).is_ok());
        }

        #[test]
        fn invalid_hostname_shall_fail(hostname in invalid_hostname()) {
            let service = format!("{hostname}:5000");
            proptest::prop_assert!(split_host_port(&service).is_err());
        }
    }
}
