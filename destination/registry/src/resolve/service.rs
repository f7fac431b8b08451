use super::{ready, stream_backends};
use anyhow::Result;
use linkerd_destination_core::{
    Destination, DiscoverBackends, Done, Emitter, IpTarget, Resolve, Scheme, ServiceHost,
    ServiceRef,
};
use std::{fmt, sync::Arc};

/// Resolves cluster-local service names and service cluster IPs to the
/// service's ready backends.
pub struct Service<D> {
    discover: D,
    cluster_domain: Arc<str>,
}

impl<D> Service<D> {
    pub fn new(discover: D, cluster_domain: impl Into<Arc<str>>) -> Self {
        Self {
            discover,
            cluster_domain: cluster_domain.into(),
        }
    }
}

impl<D: DiscoverBackends> Service<D> {
    fn target(&self, dst: &Destination) -> Option<ServiceRef> {
        match dst.scheme {
            Scheme::Service => match dst.service_host(&self.cluster_domain)? {
                ServiceHost::Service(svc) => Some(svc),
                ServiceHost::Instance { .. } => None,
            },
            Scheme::Ip => match self.discover.lookup_ip(dst.ip()?)? {
                IpTarget::Service(svc) => Some(svc),
                IpTarget::Pod(_) => None,
            },
            Scheme::Mirror => None,
        }
    }
}

impl<D> fmt::Debug for Service<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("cluster_domain", &self.cluster_domain)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<D: DiscoverBackends> Resolve for Service<D> {
    fn name(&self) -> &'static str {
        "service"
    }

    fn can_resolve(&self, dst: &Destination) -> bool {
        self.target(dst).is_some()
    }

    async fn stream_resolution(&self, dst: Destination, emit: Emitter, done: Done) -> Result<()> {
        let service = self
            .target(&dst)
            .ok_or_else(|| anyhow::anyhow!("{dst} no longer refers to a service"))?;
        tracing::debug!(%service, port = dst.port, "watching service");
        stream_backends(
            emit,
            done,
            || self.discover.watch_service(service.clone(), dst.port),
            ready,
        )
        .await
    }
}
