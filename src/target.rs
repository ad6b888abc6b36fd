//! Target address parsing: a scheme prefix selects the resolution strategy.

use std::fmt;
use std::net::SocketAddr;

/// Scheme for a literal, comma-separated list of socket addresses.
pub const STATIC_SCHEME: &str = "static";
/// Scheme for `host:port` names resolved through DNS.
pub const DNS_SCHEME: &str = "dns";
/// Scheme for service names resolved through the pluggable lookup source.
pub const DISCOVERY_SCHEME: &str = "discovery";

/// A parsed channel target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A fixed set of addresses, no resolution involved.
    Static(Vec<SocketAddr>),
    /// A name resolved (and kept fresh) through the resolution cache.
    Resolvable {
        /// The scheme that selects the lookup strategy.
        scheme: String,
        /// The name handed to the lookup source, e.g. `my.host:5000`.
        service: String,
    },
}

impl Target {
    /// Parses a channel target.
    ///
    /// `address` is the configured target uri in the form
    /// `scheme:[//]rest`, e.g. `static://10.0.0.1:9090,10.0.0.2:9090`,
    /// `dns:///my.host:5000` or `discovery:///my-service`. An address without
    /// a scheme uses `default_scheme`; a missing address falls back to the
    /// client `name` under `default_scheme`.
    pub fn parse(
        name: &str,
        address: Option<&str>,
        default_scheme: &str,
    ) -> Result<Target, String> {
        let (scheme, rest) = match address {
            Some(address) => match address.split_once(':') {
                // `host:port` has no scheme: the part before the first colon
                // only counts as one when it is followed by a path (`dns:/x`)
                // or is a scheme we know about, mirroring how gRPC treats
                // targets whose scheme has no registered resolver.
                Some((scheme, rest))
                    if scheme.chars().all(|c| c.is_ascii_alphabetic())
                        && !scheme.is_empty()
                        && (rest.starts_with('/') || is_known_scheme(scheme)) =>
                {
                    (scheme.to_string(), rest.trim_start_matches('/').to_string())
                }
                _ => (default_scheme.to_string(), address.to_string()),
            },
            None => (default_scheme.to_string(), name.to_string()),
        };

        if rest.is_empty() {
            return Err(format!("target for `{name}` has an empty address part"));
        }

        if scheme == STATIC_SCHEME {
            let mut addresses = Vec::new();
            for part in rest.split(',') {
                let address = part
                    .trim()
                    .parse::<SocketAddr>()
                    .map_err(|err| format!("invalid static address `{part}`: {err}"))?;
                addresses.push(address);
            }
            Ok(Target::Static(addresses))
        } else {
            Ok(Target::Resolvable {
                scheme,
                service: rest,
            })
        }
    }
}

fn is_known_scheme(scheme: &str) -> bool {
    matches!(scheme, STATIC_SCHEME | DNS_SCHEME | DISCOVERY_SCHEME)
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Static(addresses) => {
                write!(f, "{STATIC_SCHEME}://")?;
                for (i, address) in addresses.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{address}")?;
                }
                Ok(())
            }
            Target::Resolvable { scheme, service } => write!(f, "{scheme}:///{service}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_address_falls_back_to_name_and_default_scheme() {
        let target = Target::parse("orders", None, DNS_SCHEME).unwrap();
        assert_eq!(
            target,
            Target::Resolvable {
                scheme: "dns".to_string(),
                service: "orders".to_string(),
            }
        );
    }

    #[test]
    fn address_without_scheme_uses_the_default_scheme() {
        let target = Target::parse("orders", Some("my.host:5000"), DISCOVERY_SCHEME).unwrap();
        assert_eq!(
            target,
            Target::Resolvable {
                scheme: "discovery".to_string(),
                service: "my.host:5000".to_string(),
            }
        );
    }

    #[test]
    fn static_scheme_parses_a_comma_separated_address_list() {
        let target =
            Target::parse("orders", Some("static://10.0.0.1:9090,10.0.0.2:80"), DNS_SCHEME)
                .unwrap();
        assert_eq!(
            target,
            Target::Static(vec![
                "10.0.0.1:9090".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap(),
            ])
        );
    }

    #[test]
    fn static_scheme_accepts_ipv6_addresses() {
        let target = Target::parse("orders", Some("static://[::1]:8080"), DNS_SCHEME).unwrap();
        assert_eq!(target, Target::Static(vec!["[::1]:8080".parse().unwrap()]));
    }

    #[test]
    fn bare_ipv6_address_is_not_mistaken_for_a_scheme() {
        let target = Target::parse("orders", Some("[::1]:8080"), "static").unwrap();
        assert_eq!(target, Target::Static(vec!["[::1]:8080".parse().unwrap()]));
    }

    #[test]
    fn single_slash_uri_form_is_accepted() {
        let target = Target::parse("orders", Some("dns:/localhost:9090"), "discovery").unwrap();
        assert_eq!(
            target,
            Target::Resolvable {
                scheme: "dns".to_string(),
                service: "localhost:9090".to_string(),
            }
        );
    }

    #[test]
    fn host_port_with_alphabetic_host_is_not_mistaken_for_a_scheme() {
        let target = Target::parse("orders", Some("localhost:9090"), DNS_SCHEME).unwrap();
        assert_eq!(
            target,
            Target::Resolvable {
                scheme: "dns".to_string(),
                service: "localhost:9090".to_string(),
            }
        );
    }

    #[test]
    fn malformed_static_address_is_rejected() {
        let err = Target::parse("orders", Some("static://not-an-address"), DNS_SCHEME)
            .unwrap_err();
        assert!(err.contains("not-an-address"));
    }

    #[test]
    fn empty_address_part_is_rejected() {
        assert!(Target::parse("orders", Some("dns:///"), DNS_SCHEME).is_err());
    }
}
