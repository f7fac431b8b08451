use super::stream_backends;
use anyhow::Result;
use linkerd_destination_core::{
    Backends, Destination, DiscoverBackends, Done, Emitter, Endpoint, IpTarget, PodRef, Resolve,
    Scheme, ServiceHost, ServiceRef,
};
use std::{fmt, sync::Arc};

/// Resolves destinations that address a single pod: a headless service
/// instance name like `web-0.web.ns.svc.cluster.local`, or a pod IP.
///
/// Pod endpoints are published as long as the pod exists, regardless of its
/// readiness.
pub struct Pod<D> {
    discover: D,
    cluster_domain: Arc<str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Target {
    Instance {
        hostname: String,
        service: ServiceRef,
    },
    Pod(PodRef),
}

impl<D> Pod<D> {
    pub fn new(discover: D, cluster_domain: impl Into<Arc<str>>) -> Self {
        Self {
            discover,
            cluster_domain: cluster_domain.into(),
        }
    }
}

impl<D: DiscoverBackends> Pod<D> {
    fn target(&self, dst: &Destination) -> Option<Target> {
        match dst.scheme {
            Scheme::Service => match dst.service_host(&self.cluster_domain)? {
                ServiceHost::Instance { hostname, service } => {
                    Some(Target::Instance { hostname, service })
                }
                ServiceHost::Service(_) => None,
            },
            Scheme::Ip => match self.discover.lookup_ip(dst.ip()?)? {
                IpTarget::Pod(pod) => Some(Target::Pod(pod)),
                IpTarget::Service(_) => None,
            },
            Scheme::Mirror => None,
        }
    }
}

impl<D> fmt::Debug for Pod<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pod")
            .field("cluster_domain", &self.cluster_domain)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<D: DiscoverBackends> Resolve for Pod<D> {
    fn name(&self) -> &'static str {
        "pod"
    }

    fn can_resolve(&self, dst: &Destination) -> bool {
        self.target(dst).is_some()
    }

    async fn stream_resolution(&self, dst: Destination, emit: Emitter, done: Done) -> Result<()> {
        let port = dst.port;
        match self
            .target(&dst)
            .ok_or_else(|| anyhow::anyhow!("{dst} no longer refers to a pod"))?
        {
            Target::Instance { hostname, service } => {
                tracing::debug!(%service, %hostname, port, "watching service instance");
                stream_backends(
                    emit,
                    done,
                    || self.discover.watch_service(service.clone(), port),
                    |backends| instance(backends, &hostname),
                )
                .await
            }
            Target::Pod(pod) => {
                tracing::debug!(pod = %pod.name, namespace = %pod.namespace, port, "watching pod");
                stream_backends(
                    emit,
                    done,
                    || self.discover.watch_pod(pod.clone(), port),
                    |backends| {
                        backends
                            .exists
                            .then(|| backends.records.iter().map(|r| r.to_endpoint()).collect())
                    },
                )
                .await
            }
        }
    }
}

/// Selects the backend whose hostname matches.
fn instance(backends: &Backends, hostname: &str) -> Option<Vec<Endpoint>> {
    if !backends.exists {
        return None;
    }
    let record = backends
        .records
        .iter()
        .find(|r| r.hostname.as_deref() == Some(hostname))?;
    Some(vec![record.to_endpoint()])
}
