use super::{ready, stream_backends};
use anyhow::Result;
use linkerd_destination_core::{
    Destination, DiscoverBackends, Done, Emitter, Resolve, Scheme, ServiceHost, ServiceRef,
};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Resolves services mirrored from remote clusters.
///
/// A mirrored service is named `<svc>-<cluster>.<ns>.svc.<domain>` locally and
/// resolves to the ready backends of `<svc>.<ns>` in the remote cluster.
pub struct Mirror<D> {
    clusters: BTreeMap<String, D>,
    cluster_domain: Arc<str>,
}

impl<D> Mirror<D> {
    pub fn new(
        clusters: impl IntoIterator<Item = (String, D)>,
        cluster_domain: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            clusters: clusters.into_iter().collect(),
            cluster_domain: cluster_domain.into(),
        }
    }

    fn target(&self, dst: &Destination) -> Option<(&D, ServiceRef)> {
        let (cluster, service) = remote_service(
            dst,
            &self.cluster_domain,
            self.clusters.keys().map(String::as_str),
        )?;
        Some((self.clusters.get(cluster)?, service))
    }
}

/// Parses a mirror destination as a service in one of the named remote
/// clusters, returning the cluster's name and the remote service.
pub fn remote_service<'c>(
    dst: &Destination,
    cluster_domain: &str,
    clusters: impl IntoIterator<Item = &'c str>,
) -> Option<(&'c str, ServiceRef)> {
    if dst.scheme != Scheme::Mirror {
        return None;
    }
    let ServiceHost::Service(mirror) = dst.service_host(cluster_domain)? else {
        return None;
    };
    // When cluster names overlap (e.g. `east` and `us-east`), the longest
    // matching suffix wins.
    let (cluster, name) = clusters
        .into_iter()
        .filter_map(|cluster| {
            let name = mirror.name.strip_suffix(cluster)?.strip_suffix('-')?;
            (!name.is_empty()).then_some((cluster, name))
        })
        .max_by_key(|(cluster, _)| cluster.len())?;
    Some((
        cluster,
        ServiceRef {
            name: name.to_string(),
            namespace: mirror.namespace,
        },
    ))
}

impl<D> fmt::Debug for Mirror<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mirror")
            .field("clusters", &self.clusters.keys().collect::<Vec<_>>())
            .field("cluster_domain", &self.cluster_domain)
            .finish()
    }
}

#[async_trait::async_trait]
impl<D: DiscoverBackends> Resolve for Mirror<D> {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn can_resolve(&self, dst: &Destination) -> bool {
        self.target(dst).is_some()
    }

    async fn stream_resolution(&self, dst: Destination, emit: Emitter, done: Done) -> Result<()> {
        let (discover, service) = self
            .target(&dst)
            .ok_or_else(|| anyhow::anyhow!("{dst} does not name a mirrored service"))?;
        tracing::debug!(%service, port = dst.port, "watching remote service");
        stream_backends(
            emit,
            done,
            || discover.watch_service(service.clone(), dst.port),
            ready,
        )
        .await
    }
}
