use crate::{Endpoint, Hint, ServiceRef};
use anyhow::Result;
use futures::prelude::*;
use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    pin::Pin,
};

/// Models a live view of cluster state.
///
/// Each watch yields complete snapshots, not changes. Implementations must
/// yield the current state first.
#[async_trait::async_trait]
pub trait DiscoverBackends: Send + Sync + 'static {
    /// Watches the backends of a service port.
    ///
    /// The watch continues to yield snapshots while the service does not exist
    /// (with `exists` unset) so that it may be created later.
    async fn watch_service(&self, service: ServiceRef, port: u16) -> Result<BackendStream>;

    /// Watches a single pod's port.
    async fn watch_pod(&self, pod: PodRef, port: u16) -> Result<BackendStream>;

    /// Finds the resource that owns an IP address, if any.
    fn lookup_ip(&self, addr: IpAddr) -> Option<IpTarget>;
}

pub type BackendStream = Pin<Box<dyn Stream<Item = Backends> + Send + Sync + 'static>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

/// The resource that owns an IP address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpTarget {
    Service(ServiceRef),
    Pod(PodRef),
}

/// A snapshot of a service's (or pod's) backends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Backends {
    pub exists: bool,
    pub records: Vec<BackendRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendRecord {
    pub addr: SocketAddr,
    pub identity: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub ready: bool,

    /// The backend's hostname within a headless service, if any.
    pub hostname: Option<String>,

    pub hint: Option<Hint>,
}

// === impl Backends ===

impl Backends {
    pub fn missing() -> Self {
        Self::default()
    }

    /// Returns an endpoint for each ready backend.
    pub fn ready_endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.records
            .iter()
            .filter(|r| r.ready)
            .map(BackendRecord::to_endpoint)
    }
}

// === impl BackendRecord ===

impl BackendRecord {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            identity: None,
            labels: BTreeMap::new(),
            ready: true,
            hostname: None,
            hint: None,
        }
    }

    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint {
            addr: self.addr,
            identity: self.identity.clone(),
            metric_labels: self.labels.clone(),
            weight: None,
            hint: self.hint,
        }
    }
}
