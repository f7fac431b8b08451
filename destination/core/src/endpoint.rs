use std::{cmp::Ordering, collections::BTreeMap, hash, net::SocketAddr};

/// A concrete, network-reachable backend for a destination.
///
/// Endpoints are identified by their socket address alone: the identity,
/// labels, weight and hint are payload and do not participate in equality,
/// ordering or hashing.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub identity: Option<String>,
    pub metric_labels: BTreeMap<String, String>,
    pub weight: Option<u32>,
    pub hint: Option<Hint>,
}

/// Describes how a client may communicate with an endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Hint {
    /// The endpoint is meshed and accepts HTTP/2 from peer proxies.
    H2,

    /// The endpoint is meshed but its port is opaque; connections should be
    /// tunneled to the proxy's inbound port.
    Opaque { inbound_port: u16 },
}

// === impl Endpoint ===

impl Endpoint {
    pub fn new(addr: impl Into<SocketAddr>) -> Self {
        Self {
            addr: addr.into(),
            identity: None,
            metric_labels: BTreeMap::new(),
            weight: None,
            hint: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metric_labels.insert(key.into(), value.into());
        self
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Endpoint {}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr.cmp(&other.addr)
    }
}

impl hash::Hash for Endpoint {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_address_only() {
        let a = Endpoint::new(([10, 0, 0, 1], 80)).with_identity("a.ns.serviceaccount");
        let b = Endpoint::new(([10, 0, 0, 1], 80)).with_label("pod", "b");
        let c = Endpoint::new(([10, 0, 0, 1], 81));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }
}
