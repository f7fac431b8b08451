use crate::{
    core::Resolve,
    grpc::{DestinationServer, GrpcServerMetricsFamily},
    index::{self, ports::parse_portset, ClusterInfo, IndexMetricsFamily},
    registry::{
        self,
        resolve::{LiteralIp, Mirror, Pod, Service},
        Registry, RegistryMetrics, Resolvers,
    },
    ClusterDiscover,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use k8s_openapi::api::{core::v1 as corev1, discovery::v1 as discoveryv1};
use kube::runtime::{watcher, WatchStreamExt};
use prometheus_client::registry::Registry as Prometheus;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tonic::transport::Server;
use tracing::{info, info_span, instrument, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "destination", about = "A destination resolution controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_DESTINATION_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8086")]
    grpc_addr: SocketAddr,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    #[clap(long, default_value = "cluster.local")]
    identity_domain: String,

    #[clap(long, default_value = "linkerd")]
    control_plane_namespace: String,

    #[clap(long, default_value = "25,587,3306,4444,5432,6379,9300,11211")]
    default_opaque_ports: String,

    /// How long a destination remains watched after its last subscriber
    /// disconnects.
    #[clap(long, default_value = "5000")]
    watch_linger_ms: u64,

    /// The number of updates buffered for each subscriber before it is
    /// disconnected.
    #[clap(long, default_value = "100")]
    subscriber_buffer: usize,

    /// A remote cluster whose services may be mirrored, as
    /// `NAME=KUBECONFIG_PATH`. May be repeated.
    #[clap(long = "remote-cluster")]
    remote_clusters: Vec<RemoteCluster>,
}

#[derive(Clone, Debug)]
struct RemoteCluster {
    name: String,
    kubeconfig: PathBuf,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            grpc_addr,
            cluster_domain,
            identity_domain,
            control_plane_namespace,
            default_opaque_ports,
            watch_linger_ms,
            subscriber_buffer,
            remote_clusters,
        } = self;

        if subscriber_buffer == 0 {
            bail!("--subscriber-buffer must be at least 1");
        }

        let cluster_info = Arc::new(ClusterInfo {
            control_plane_ns: control_plane_namespace,
            identity_domain,
            default_opaque_ports: parse_portset(&default_opaque_ports)?,
        });

        let mut prom = <Prometheus>::default();
        let index_metrics = IndexMetricsFamily::register(prom.sub_registry_with_prefix("index"));
        let registry_metrics =
            RegistryMetrics::register(prom.sub_registry_with_prefix("destination"));
        let grpc_metrics =
            GrpcServerMetricsFamily::register(prom.sub_registry_with_prefix("grpc_server"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches for the local cluster.
        let index = index::Index::shared(cluster_info.clone());

        let services = runtime.watch_all::<corev1::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.wrap(index.clone()), services)
                .instrument(info_span!("services")),
        );

        let slices = runtime.watch_all::<discoveryv1::EndpointSlice>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.wrap(index.clone()), slices)
                .instrument(info_span!("endpointslices")),
        );

        let pods = runtime.watch_all::<corev1::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index_metrics.wrap(index.clone()), pods)
                .instrument(info_span!("pods")),
        );

        // Remote clusters are watched with their own clients so that mirrored
        // services resolve against the cluster that runs them.
        let mut mirrors = Vec::with_capacity(remote_clusters.len());
        for RemoteCluster { name, kubeconfig } in remote_clusters {
            let remote = watch_remote(&name, &kubeconfig, cluster_info.clone())
                .await
                .with_context(|| format!("failed to watch remote cluster {name}"))?;
            mirrors.push((name, ClusterDiscover::new(remote)));
        }
        let remote_names = mirrors
            .iter()
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        let discover = ClusterDiscover::new(index);
        let resolvers = Resolvers::new([
            Arc::new(Mirror::new(mirrors, cluster_domain.clone())) as Arc<dyn Resolve>,
            Arc::new(Service::new(discover.clone(), cluster_domain.clone())),
            Arc::new(Pod::new(discover, cluster_domain.clone())),
            Arc::new(LiteralIp::default()),
        ]);
        info!(?resolvers, "resolving destinations");

        let registry = Registry::new(
            registry::Config {
                linger: Duration::from_millis(watch_linger_ms),
                subscriber_capacity: subscriber_buffer,
            },
            resolvers,
            registry_metrics,
        );

        // Run the gRPC server, serving subscriptions from the registry.
        let server = DestinationServer::new(
            registry,
            cluster_domain,
            remote_names,
            grpc_metrics,
            runtime.shutdown_handle(),
        );
        tokio::spawn(grpc(grpc_addr, server, runtime.shutdown_handle()));

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Indexes a remote cluster's discovery resources.
#[instrument(skip_all, fields(cluster = %name))]
async fn watch_remote(
    name: &str,
    kubeconfig: &std::path::Path,
    cluster_info: Arc<ClusterInfo>,
) -> Result<index::SharedIndex> {
    let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?;
    let client = kube::Client::try_from(config)?;

    let index = index::Index::shared(cluster_info);
    tokio::spawn(
        kubert::index::namespaced(index.clone(), watch_all::<corev1::Service>(client.clone()))
            .instrument(info_span!("services")),
    );
    tokio::spawn(
        kubert::index::namespaced(
            index.clone(),
            watch_all::<discoveryv1::EndpointSlice>(client.clone()),
        )
        .instrument(info_span!("endpointslices")),
    );
    tokio::spawn(
        kubert::index::namespaced(index.clone(), watch_all::<corev1::Pod>(client))
            .instrument(info_span!("pods")),
    );

    info!("watching remote cluster");
    Ok(index)
}

/// Watches all resources of kind `T`, retrying failed watches with backoff.
fn watch_all<T>(client: kube::Client) -> impl Stream<Item = watcher::Event<T>> + Send + 'static
where
    T: kube::Resource<DynamicType = ()>
        + serde::de::DeserializeOwned
        + Clone
        + std::fmt::Debug
        + Send
        + 'static,
{
    watcher(kube::Api::<T>::all(client), watcher::Config::default())
        .default_backoff()
        .filter_map(|res| {
            future::ready(match res {
                Ok(event) => Some(event),
                Err(error) => {
                    warn!(%error, "watch failed");
                    None
                }
            })
        })
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(addr: SocketAddr, server: DestinationServer, drain: drain::Watch) -> Result<()> {
    let (close_tx, close_rx) = oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(server.svc())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "destination gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

// === impl RemoteCluster ===

impl std::str::FromStr for RemoteCluster {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((name, path)) = s.split_once('=') else {
            bail!("remote clusters must be specified as NAME=KUBECONFIG_PATH");
        };
        if name.is_empty() || path.is_empty() {
            bail!("remote clusters must be specified as NAME=KUBECONFIG_PATH");
        }
        Ok(Self {
            name: name.to_string(),
            kubeconfig: path.into(),
        })
    }
}
