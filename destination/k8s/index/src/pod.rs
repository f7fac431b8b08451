use crate::{
    ports::{self, ports_annotation, PortSet},
    ClusterInfo,
};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use linkerd_destination_core::{BackendRecord, Hint};
use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
};

pub(crate) const OPAQUE_PORTS_ANNOTATION: &str = "config.linkerd.io/opaque-ports";
const PROXY_VERSION_ANNOTATION: &str = "linkerd.io/proxy-version";
const PROXY_INBOUND_PORT_NAME: &str = "linkerd-proxy";
const DEFAULT_PROXY_INBOUND_PORT: u16 = 4143;

/// The metadata of a pod that is published with its endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PodInfo {
    pub(crate) ip: Option<IpAddr>,

    /// Set when the pod has a running proxy.
    pub(crate) identity: Option<String>,
    inbound_port: Option<u16>,

    opaque_ports: Option<PortSet>,
    labels: BTreeMap<String, String>,
}

impl PodInfo {
    pub(crate) fn new(pod: &Pod, cluster_info: &ClusterInfo) -> Self {
        let name = pod.name_unchecked();
        let ns = pod.namespace().unwrap_or_default();
        let sa = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.clone())
            .unwrap_or_else(|| "default".to_string());

        let status = pod.status.as_ref();
        let terminated = status
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");
        let ip = status
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|_| !terminated)
            .and_then(|ip| match ip.parse() {
                Ok(ip) => Some(ip),
                Err(error) => {
                    tracing::warn!(%error, pod = %name, %ip, "invalid pod IP");
                    None
                }
            });

        let meshed = pod.annotations().contains_key(PROXY_VERSION_ANNOTATION);
        let identity = meshed.then(|| cluster_info.service_account_identity(&ns, &sa));
        let inbound_port = meshed.then(|| proxy_inbound_port(pod));

        let mut labels = workload_labels(pod);
        labels.insert("pod".to_string(), name);
        labels.insert("serviceaccount".to_string(), sa);
        labels.insert("namespace".to_string(), ns);

        Self {
            ip,
            identity,
            inbound_port,
            opaque_ports: ports_annotation(pod.annotations(), OPAQUE_PORTS_ANNOTATION),
            labels,
        }
    }

    /// Builds a backend record for `addr`, a port on this pod.
    ///
    /// `service_opaque` indicates whether the port is opaque according to the
    /// service that targets it, if the service configures opaque ports.
    pub(crate) fn record(
        &self,
        addr: SocketAddr,
        service_opaque: Option<bool>,
        cluster_info: &ClusterInfo,
    ) -> BackendRecord {
        let hint = self.inbound_port.map(|inbound_port| {
            let opaque = service_opaque.unwrap_or_else(|| {
                let ports = self
                    .opaque_ports
                    .as_ref()
                    .unwrap_or(&cluster_info.default_opaque_ports);
                ports::contains(ports, addr.port())
            });
            if opaque {
                Hint::Opaque { inbound_port }
            } else {
                Hint::H2
            }
        });

        BackendRecord {
            identity: self.identity.clone(),
            labels: self.labels.clone(),
            hint,
            ..BackendRecord::new(addr)
        }
    }
}

fn proxy_inbound_port(pod: &Pod) -> u16 {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter().chain(spec.init_containers.iter().flatten()))
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(PROXY_INBOUND_PORT_NAME))
        .and_then(|p| u16::try_from(p.container_port).ok())
        .unwrap_or(DEFAULT_PROXY_INBOUND_PORT)
}

/// Labels a pod with its owning workload, e.g. `deployment=web`.
fn workload_labels(pod: &Pod) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for owner in pod.owner_references() {
        let kind = owner.kind.to_ascii_lowercase();
        if kind == "replicaset" {
            // Pods created by deployments are owned by a replicaset named
            // after the deployment and the pod template's hash.
            if let Some(deployment) = pod
                .labels()
                .get("pod-template-hash")
                .and_then(|hash| owner.name.strip_suffix(hash.as_str()))
                .and_then(|n| n.strip_suffix('-'))
            {
                labels.insert("deployment".to_string(), deployment.to_string());
            }
        }
        labels.insert(kind, owner.name.clone());
    }
    labels
}
