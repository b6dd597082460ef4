//! Hostname and dotted-quad address resolution for match setup.
//!
//! Match listings hand addresses around as strings that may be either a
//! literal dotted-quad IP or a hostname. A string whose first character is a
//! digit is treated as a literal and never sent to DNS; everything else goes
//! through the system resolver. Only IPv4 results are considered, matching
//! the transport.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use tracing::warn;

/// Resolves `host` to an IPv4 address.
///
/// Returns `None` for the empty string, for unparsable literals and for
/// hostnames the resolver cannot answer. Resolution failures are logged,
/// not fatal: a missing peer address surfaces later as a setup error.
#[must_use]
pub fn resolve_host(host: &str) -> Option<Ipv4Addr> {
    if host.is_empty() {
        return None;
    }
    // Digit-leading strings are address literals; do not ask DNS about them.
    if host.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return match host.parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!("'{host}' looks like an address literal but does not parse: {e}");
                None
            }
        };
    }
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => {
            let ip = addrs
                .filter_map(|addr| match addr {
                    SocketAddr::V4(v4) => Some(*v4.ip()),
                    SocketAddr::V6(_) => None,
                })
                .next();
            if ip.is_none() {
                warn!("'{host}' resolved to no IPv4 addresses");
            }
            ip
        }
        Err(e) => {
            warn!("Failed to resolve '{host}': {e}");
            None
        }
    }
}

/// [`resolve_host`], with the result as a host-order `u32` for compact
/// storage in match setup records.
#[must_use]
pub fn resolve_host_u32(host: &str) -> Option<u32> {
    resolve_host(host).map(u32::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_resolves_to_nothing() {
        assert_eq!(resolve_host(""), None);
    }

    #[test]
    fn dotted_quad_parses_without_dns() {
        assert_eq!(
            resolve_host("192.168.1.40"),
            Some(Ipv4Addr::new(192, 168, 1, 40))
        );
        assert_eq!(resolve_host("127.0.0.1"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn malformed_literals_do_not_fall_back_to_dns() {
        assert_eq!(resolve_host("300.1.2.3"), None);
        assert_eq!(resolve_host("1.2.3"), None);
    }

    #[test]
    fn localhost_resolves_via_the_system_resolver() {
        assert_eq!(resolve_host("localhost"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn u32_form_is_host_order() {
        assert_eq!(resolve_host_u32("127.0.0.1"), Some(0x7f000001));
    }
}
