use crate::{
    metrics::SizedIndex,
    pod::{PodInfo, OPAQUE_PORTS_ANNOTATION},
    ports::{self, ports_annotation, PortSet},
    ClusterInfo,
};
use ahash::AHashMap as HashMap;
use k8s_openapi::{
    api::{core::v1 as corev1, discovery::v1 as discoveryv1},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;
use linkerd_destination_core::{BackendRecord, Backends, IpTarget, PodRef, ServiceRef};
use parking_lot::RwLock;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::sync::watch;

/// The label that links an `EndpointSlice` to its `Service`.
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the cluster's services, endpoint slices, and pods, and publishes the
/// backends of each watched service-port and pod-port.
#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,
    namespaces: HashMap<String, Namespace>,
    services_by_ip: HashMap<IpAddr, ServiceRef>,
    pods_by_ip: HashMap<IpAddr, PodRef>,
}

#[derive(Debug, Default)]
struct Namespace {
    services: HashMap<String, ServiceInfo>,
    slices: HashMap<String, SliceInfo>,
    pods: HashMap<String, PodInfo>,
    service_watches: HashMap<ServicePort, watch::Sender<Backends>>,
    pod_watches: HashMap<PodPort, watch::Sender<Backends>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ServicePort {
    service: String,
    port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PodPort {
    pod: String,
    port: u16,
}

#[derive(Debug, Default)]
struct ServiceInfo {
    cluster_ips: Vec<IpAddr>,
    ports: Vec<ServicePortSpec>,
    opaque_ports: Option<PortSet>,
}

#[derive(Debug)]
struct ServicePortSpec {
    name: Option<String>,
    port: u16,
    target: Option<IntOrString>,
}

#[derive(Debug)]
struct SliceInfo {
    service: String,
    ports: Vec<(Option<String>, u16)>,
    endpoints: Vec<SliceEndpoint>,
}

#[derive(Debug)]
struct SliceEndpoint {
    addrs: Vec<IpAddr>,
    ready: bool,
    hostname: Option<String>,
    pod: Option<String>,
}

// === impl Index ===

impl Index {
    pub fn shared(cluster_info: Arc<ClusterInfo>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            cluster_info,
            namespaces: HashMap::default(),
            services_by_ip: HashMap::default(),
            pods_by_ip: HashMap::default(),
        }))
    }

    /// Watches the backends of a service's port.
    ///
    /// The watch is updated as the service, its endpoint slices, and its pods
    /// change, including while the service does not exist.
    pub fn service_rx(&mut self, service: ServiceRef, port: u16) -> watch::Receiver<Backends> {
        let key = ServicePort {
            service: service.name,
            port,
        };
        if let Some(tx) = self
            .namespaces
            .get(&service.namespace)
            .and_then(|ns| ns.service_watches.get(&key))
        {
            return tx.subscribe();
        }

        self.prune();
        let ns = self.namespaces.entry(service.namespace).or_default();
        tracing::debug!(?key, "subscribing to service port");
        let backends = ns.service_backends(&key, &self.cluster_info);
        let (tx, rx) = watch::channel(backends);
        ns.service_watches.insert(key, tx);
        rx
    }

    /// Watches a single port on a pod.
    pub fn pod_rx(&mut self, pod: PodRef, port: u16) -> watch::Receiver<Backends> {
        let key = PodPort {
            pod: pod.name,
            port,
        };
        if let Some(tx) = self
            .namespaces
            .get(&pod.namespace)
            .and_then(|ns| ns.pod_watches.get(&key))
        {
            return tx.subscribe();
        }

        self.prune();
        let ns = self.namespaces.entry(pod.namespace).or_default();
        tracing::debug!(?key, "subscribing to pod port");
        let backends = ns.pod_backends(&key, &self.cluster_info);
        let (tx, rx) = watch::channel(backends);
        ns.pod_watches.insert(key, tx);
        rx
    }

    /// Finds the service or pod that owns an IP address. Services take
    /// precedence.
    pub fn lookup_ip(&self, addr: IpAddr) -> Option<IpTarget> {
        if let Some(service) = self.services_by_ip.get(&addr) {
            return Some(IpTarget::Service(service.clone()));
        }
        self.pods_by_ip.get(&addr).cloned().map(IpTarget::Pod)
    }

    fn namespace(&mut self, ns: String) -> &mut Namespace {
        self.namespaces.entry(ns).or_default()
    }

    fn reindex(&mut self, ns: &str) {
        if let Some(namespace) = self.namespaces.get_mut(ns) {
            namespace.send_if_modified(&self.cluster_info);
            if namespace.is_empty() {
                self.namespaces.remove(ns);
            }
        }
    }

    /// Drops watches that no longer have receivers, along with namespaces
    /// that hold neither resources nor watches.
    ///
    /// Lookups may name namespaces that never see a resource event, so this
    /// runs whenever a new watch is created.
    fn prune(&mut self) {
        self.namespaces.retain(|_, ns| {
            ns.prune_watches();
            !ns.is_empty()
        });
    }

    #[cfg(test)]
    pub(crate) fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    #[cfg(test)]
    pub(crate) fn watch_count(&self) -> usize {
        self.namespaces
            .values()
            .map(|ns| ns.service_watches.len() + ns.pod_watches.len())
            .sum()
    }
}

impl kubert::index::IndexNamespacedResource<corev1::Service> for Index {
    fn apply(&mut self, service: corev1::Service) {
        let name = service.name_unchecked();
        let Some(ns) = service.namespace() else {
            tracing::warn!(service = %name, "ignoring service without a namespace");
            return;
        };
        let spec = service.spec.as_ref();

        let mut cluster_ips = spec
            .into_iter()
            .flat_map(|spec| spec.cluster_ips.iter().flatten().chain(spec.cluster_ip.iter()))
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .filter_map(|ip| match ip.parse::<IpAddr>() {
                Ok(addr) => Some(addr),
                Err(error) => {
                    tracing::error!(%error, service = %name, cluster_ip = %ip, "invalid cluster ip");
                    None
                }
            })
            .collect::<Vec<_>>();
        cluster_ips.sort();
        cluster_ips.dedup();

        let ports = spec
            .into_iter()
            .flat_map(|spec| spec.ports.iter().flatten())
            .filter_map(|p| {
                Some(ServicePortSpec {
                    name: p.name.clone().filter(|n| !n.is_empty()),
                    port: u16::try_from(p.port).ok()?,
                    target: p.target_port.clone(),
                })
            })
            .collect();

        let svc_ref = ServiceRef {
            name: name.clone(),
            namespace: ns.clone(),
        };
        self.services_by_ip.retain(|_, s| *s != svc_ref);
        for ip in &cluster_ips {
            self.services_by_ip.insert(*ip, svc_ref.clone());
        }

        tracing::debug!(service = %name, namespace = %ns, ?cluster_ips, "indexing service");
        let info = ServiceInfo {
            cluster_ips,
            ports,
            opaque_ports: ports_annotation(service.annotations(), OPAQUE_PORTS_ANNOTATION),
        };
        self.namespace(ns.clone()).services.insert(name, info);
        self.reindex(&ns);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let Some(ns) = self.namespaces.get_mut(&namespace) else {
            return;
        };
        let Some(info) = ns.services.remove(&name) else {
            return;
        };
        tracing::debug!(service = %name, %namespace, cluster_ips = ?info.cluster_ips, "removing service");
        self.services_by_ip
            .retain(|_, s| s.name != name || s.namespace != namespace);
        self.reindex(&namespace);
    }
}

impl kubert::index::IndexNamespacedResource<discoveryv1::EndpointSlice> for Index {
    fn apply(&mut self, slice: discoveryv1::EndpointSlice) {
        let name = slice.name_unchecked();
        let Some(ns) = slice.namespace() else {
            return;
        };
        let Some(service) = slice.labels().get(SERVICE_NAME_LABEL).cloned() else {
            tracing::debug!(slice = %name, namespace = %ns, "ignoring endpoint slice without a service");
            return;
        };

        let ports = slice
            .ports
            .iter()
            .flatten()
            .filter_map(|p| {
                let port = u16::try_from(p.port?).ok()?;
                Some((p.name.clone().filter(|n| !n.is_empty()), port))
            })
            .collect();

        let endpoints = slice
            .endpoints
            .iter()
            .map(|ep| SliceEndpoint {
                addrs: ep
                    .addresses
                    .iter()
                    .filter_map(|a| a.parse().ok())
                    .collect(),
                // Readiness is assumed when unset.
                ready: ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true),
                hostname: ep.hostname.clone(),
                pod: ep
                    .target_ref
                    .as_ref()
                    .filter(|r| r.kind.as_deref() == Some("Pod"))
                    .and_then(|r| r.name.clone()),
            })
            .collect();

        tracing::debug!(slice = %name, namespace = %ns, %service, "indexing endpoint slice");
        self.namespace(ns.clone()).slices.insert(
            name,
            SliceInfo {
                service,
                ports,
                endpoints,
            },
        );
        self.reindex(&ns);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let removed = self
            .namespaces
            .get_mut(&namespace)
            .and_then(|ns| ns.slices.remove(&name));
        if removed.is_some() {
            tracing::debug!(slice = %name, %namespace, "removing endpoint slice");
            self.reindex(&namespace);
        }
    }
}

impl kubert::index::IndexNamespacedResource<corev1::Pod> for Index {
    fn apply(&mut self, pod: corev1::Pod) {
        let name = pod.name_unchecked();
        let Some(ns) = pod.namespace() else {
            return;
        };
        let info = PodInfo::new(&pod, &self.cluster_info);

        let pod_ref = PodRef {
            name: name.clone(),
            namespace: ns.clone(),
        };
        self.pods_by_ip.retain(|_, p| *p != pod_ref);
        if let Some(ip) = info.ip {
            self.pods_by_ip.insert(ip, pod_ref);
        }

        let namespace = self.namespace(ns.clone());
        if namespace.pods.get(&name) == Some(&info) {
            return;
        }
        tracing::debug!(pod = %name, namespace = %ns, ip = ?info.ip, "indexing pod");
        namespace.pods.insert(name, info);
        self.reindex(&ns);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let Some(info) = self
            .namespaces
            .get_mut(&namespace)
            .and_then(|ns| ns.pods.remove(&name))
        else {
            return;
        };
        tracing::debug!(pod = %name, %namespace, "removing pod");
        if let Some(ip) = info.ip {
            if self
                .pods_by_ip
                .get(&ip)
                .is_some_and(|p| p.name == name && p.namespace == namespace)
            {
                self.pods_by_ip.remove(&ip);
            }
        }
        self.reindex(&namespace);
    }
}

impl SizedIndex<corev1::Service> for Index {
    fn size(&self) -> usize {
        self.namespaces.values().map(|ns| ns.services.len()).sum()
    }
}

impl SizedIndex<discoveryv1::EndpointSlice> for Index {
    fn size(&self) -> usize {
        self.namespaces.values().map(|ns| ns.slices.len()).sum()
    }
}

impl SizedIndex<corev1::Pod> for Index {
    fn size(&self) -> usize {
        self.namespaces.values().map(|ns| ns.pods.len()).sum()
    }
}

// === impl Namespace ===

impl Namespace {
    /// Recomputes every watched port, notifying watchers whose backends
    /// changed. Watches without receivers are dropped.
    fn send_if_modified(&mut self, cluster_info: &ClusterInfo) {
        self.prune_watches();

        for (key, tx) in self.service_watches.iter() {
            let backends = self.service_backends(key, cluster_info);
            send_if_modified(tx, backends);
        }
        for (key, tx) in self.pod_watches.iter() {
            let backends = self.pod_backends(key, cluster_info);
            send_if_modified(tx, backends);
        }
    }

    fn prune_watches(&mut self) {
        self.service_watches.retain(|_, tx| tx.receiver_count() > 0);
        self.pod_watches.retain(|_, tx| tx.receiver_count() > 0);
    }

    fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.slices.is_empty()
            && self.pods.is_empty()
            && self.service_watches.is_empty()
            && self.pod_watches.is_empty()
    }

    fn service_backends(&self, key: &ServicePort, cluster_info: &ClusterInfo) -> Backends {
        let Some(service) = self.services.get(&key.service) else {
            return Backends::missing();
        };
        let spec = service.ports.iter().find(|p| p.port == key.port);
        let service_opaque = service
            .opaque_ports
            .as_ref()
            .map(|ports| ports::contains(ports, key.port));

        let mut records = Vec::new();
        for slice in self.slices.values().filter(|s| s.service == key.service) {
            let Some(target_port) = slice.target_port(key.port, spec) else {
                continue;
            };
            for ep in &slice.endpoints {
                let pod = ep.pod.as_ref().and_then(|name| self.pods.get(name));
                for ip in &ep.addrs {
                    let addr = SocketAddr::new(*ip, target_port);
                    let record = match pod {
                        Some(pod) => pod.record(addr, service_opaque, cluster_info),
                        None => BackendRecord::new(addr),
                    };
                    records.push(BackendRecord {
                        ready: ep.ready,
                        hostname: ep.hostname.clone(),
                        ..record
                    });
                }
            }
        }
        // Slices are unordered, so sort for stable comparisons.
        records.sort_by(|a, b| a.addr.cmp(&b.addr));

        Backends {
            exists: true,
            records,
        }
    }

    fn pod_backends(&self, key: &PodPort, cluster_info: &ClusterInfo) -> Backends {
        let Some(pod) = self.pods.get(&key.pod) else {
            return Backends::missing();
        };
        let records = pod
            .ip
            .map(|ip| pod.record(SocketAddr::new(ip, key.port), None, cluster_info))
            .into_iter()
            .collect();
        Backends {
            exists: true,
            records,
        }
    }
}

// === impl SliceInfo ===

impl SliceInfo {
    /// Determines the port that a service port targets on this slice's
    /// endpoints.
    ///
    /// Slice ports are named after the service ports they implement. When the
    /// service has no such port, the requested port is used as-is.
    fn target_port(&self, port: u16, spec: Option<&ServicePortSpec>) -> Option<u16> {
        let Some(spec) = spec else {
            return Some(port);
        };

        if let Some((_, p)) = self.ports.iter().find(|(name, _)| *name == spec.name) {
            return Some(*p);
        }

        match spec.target.as_ref() {
            None => Some(port),
            Some(IntOrString::Int(p)) => u16::try_from(*p).ok(),
            Some(IntOrString::String(name)) => self
                .ports
                .iter()
                .find(|(n, _)| n.as_deref() == Some(name.as_str()))
                .map(|(_, p)| *p),
        }
    }
}

fn send_if_modified(tx: &watch::Sender<Backends>, backends: Backends) {
    tx.send_if_modified(|current| {
        if *current == backends {
            return false;
        }
        *current = backends;
        true
    });
}
