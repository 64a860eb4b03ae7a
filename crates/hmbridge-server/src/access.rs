//! IP allow-list for inbound RPC calls.

use axum::{body::Body, extract::ConnectInfo, http::Request};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Error for an allow-list entry that is neither an address nor a network.
#[derive(Debug, Error)]
#[error("invalid allow-list entry {0:?}: expected an IP address or CIDR network")]
pub struct InvalidEntry(pub String);

/// Validates the network origin of inbound calls.
///
/// An origin is authorized if it equals a listed address or falls inside a
/// listed network. IPv4-mapped IPv6 origins (`::ffff:a.b.c.d`) are compared
/// as their IPv4 form.
#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    networks: Vec<IpNet>,
}

impl AccessGate {
    /// Parses allow-list entries such as `192.168.1.10` or `10.0.0.0/24`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEntry` for the first entry that cannot be parsed.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, InvalidEntry> {
        let networks = entries
            .iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|_| InvalidEntry(entry.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { networks })
    }

    /// Returns `true` if `origin` is covered by any entry.
    pub fn is_allowed(&self, origin: IpAddr) -> bool {
        let origin = origin.to_canonical();
        self.networks.iter().any(|net| net.contains(&origin))
    }

    /// Checks an optional origin. Unknown origins are never authorized.
    pub fn authorize(&self, origin: Option<IpAddr>) -> bool {
        origin.is_some_and(|ip| self.is_allowed(ip))
    }

    /// Checks an origin given as text. Unparseable text is unauthorized.
    pub fn authorize_str(&self, origin: &str) -> bool {
        origin
            .trim()
            .parse::<IpAddr>()
            .is_ok_and(|ip| self.is_allowed(ip))
    }

    /// Number of configured entries.
    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// Reads the peer address recorded by `into_make_service_with_connect_info`.
///
/// Returns `None` when the request did not come through a connected socket
/// (for instance in router-level tests that do not inject it).
pub fn peer_ip(req: &Request<Body>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}
