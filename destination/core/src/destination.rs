use std::{fmt, net::IpAddr};

/// Identifies how a destination's path should be interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    /// A literal IP address, possibly owned by a cluster resource.
    Ip,
    /// A Kubernetes-style DNS name, e.g. `web.emojivoto.svc.cluster.local`.
    Service,
    /// A service mirrored from a remote cluster.
    Mirror,
}

/// A logical name and port that a client wants to reach.
///
/// Destinations are the identity key for watches: two requests for equal
/// destinations share one resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub scheme: Scheme,
    pub path: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    pub name: String,
    pub namespace: String,
}

/// The parsed form of a cluster-local DNS name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceHost {
    /// `<svc>.<ns>.svc.<domain>`
    Service(ServiceRef),

    /// `<hostname>.<svc>.<ns>.svc.<domain>`, addressing a single instance of a
    /// headless service.
    Instance {
        hostname: String,
        service: ServiceRef,
    },
}

// === impl Destination ===

impl Destination {
    pub fn new(scheme: Scheme, path: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            path: path.into(),
            port,
        }
    }

    /// Returns the path's IP address if it is a bare IPv4 or IPv6 literal.
    ///
    /// IPv6 literals may be bracketed, as they are in URI authorities.
    pub fn ip(&self) -> Option<IpAddr> {
        let path = self.path.as_str();
        let path = path
            .strip_prefix('[')
            .and_then(|p| p.strip_suffix(']'))
            .unwrap_or(path);
        path.parse().ok()
    }

    /// Parses the path as a cluster-local service name in `cluster_domain`.
    ///
    /// A single trailing dot (a fully-qualified name) is accepted.
    pub fn service_host(&self, cluster_domain: &str) -> Option<ServiceHost> {
        let host = self.path.strip_suffix('.').unwrap_or(&self.path);
        let prefix = host
            .strip_suffix(cluster_domain.trim_end_matches('.'))?
            .strip_suffix(".svc.")?;

        let labels = prefix.split('.').collect::<Vec<_>>();
        if !labels.iter().all(|l| is_dns_label(l)) {
            return None;
        }

        match labels.as_slice() {
            [name, namespace] => Some(ServiceHost::Service(ServiceRef {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })),
            [hostname, name, namespace] => Some(ServiceHost::Instance {
                hostname: hostname.to_string(),
                service: ServiceRef {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                },
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            _ => write!(f, "{}:{}", self.path, self.port),
        }
    }
}

// === impl ServiceRef ===

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// An RFC 1123 label, as Kubernetes requires for service and namespace names.
fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}
