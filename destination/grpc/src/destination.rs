use crate::metrics::{GrpcServerMetricsFamily, ResponseObserver, StreamRpcMetrics};
use futures::prelude::*;
use http::uri::Authority;
use linkerd2_proxy_api::destination::{
    self as api,
    destination_server::{self, DestinationServer as DestinationGrpcServer},
};
use linkerd_destination_core::{Delta, Destination, Endpoint, Error, Hint, Scheme, ServiceHost};
use linkerd_destination_registry::{resolve::remote_service, Registry, Subscription};
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tracing::{debug, info};

const SERVICE_NAME: &str = "io.linkerd.proxy.destination.Destination";

/// Endpoints are weighted equally.
const DEFAULT_WEIGHT: u32 = 10_000;

const DEFAULT_PORT: u16 = 80;

/// Serves the proxy API's `Destination` service from a [`Registry`].
#[derive(Clone, Debug)]
pub struct DestinationServer {
    registry: Registry,
    // Used to parse named addresses into <svc>.<ns>.svc.<cluster-domain>.
    cluster_domain: Arc<str>,
    remote_clusters: Arc<[String]>,
    drain: drain::Watch,
    get: StreamRpcMetrics,
    get_profile: StreamRpcMetrics,
}

type BoxUpdateStream = Pin<Box<dyn Stream<Item = Result<api::Update, tonic::Status>> + Send>>;

type BoxProfileStream =
    Pin<Box<dyn Stream<Item = Result<api::DestinationProfile, tonic::Status>> + Send>>;

// === impl DestinationServer ===

impl DestinationServer {
    pub fn new(
        registry: Registry,
        cluster_domain: impl Into<Arc<str>>,
        remote_clusters: impl IntoIterator<Item = String>,
        metrics: GrpcServerMetricsFamily,
        drain: drain::Watch,
    ) -> Self {
        Self {
            registry,
            cluster_domain: cluster_domain.into(),
            remote_clusters: remote_clusters.into_iter().collect(),
            drain,
            get: metrics.server_stream_rpc(SERVICE_NAME, "Get"),
            get_profile: metrics.server_stream_rpc(SERVICE_NAME, "GetProfile"),
        }
    }

    pub fn svc(self) -> DestinationGrpcServer<Self> {
        DestinationGrpcServer::new(self)
    }

    /// Parses a request into the destination it names.
    ///
    /// Paths are authorities of the form `host[:port]`. Hosts that are IP
    /// literals name the IP itself; other hosts are resolved as cluster
    /// names according to the request's scheme.
    fn lookup(&self, req: &api::GetDestination) -> Result<Destination, tonic::Status> {
        let scheme = match req.scheme.as_str() {
            "k8s" => Scheme::Service,
            "mirror" => Scheme::Mirror,
            scheme => {
                return Err(tonic::Status::invalid_argument(format!(
                    "unsupported scheme: {scheme:?}"
                )))
            }
        };

        let auth = req
            .path
            .parse::<Authority>()
            .map_err(|_| tonic::Status::invalid_argument("invalid authority"))?;
        // Fully-qualified names share a watch with their relative form.
        let host = auth.host();
        let host = host.strip_suffix('.').unwrap_or(host);
        if host.is_empty() {
            return Err(tonic::Status::invalid_argument(
                "authority must have a host",
            ));
        }
        let port = auth.port_u16().unwrap_or(DEFAULT_PORT);

        let ip = Destination::new(Scheme::Ip, host, port);
        if scheme == Scheme::Service && ip.ip().is_some() {
            return Ok(ip);
        }
        Ok(Destination::new(scheme, host.to_ascii_lowercase(), port))
    }

    /// The metric labels that apply to every endpoint of a destination.
    fn set_labels(&self, dst: &Destination) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        let service = match dst.service_host(&self.cluster_domain) {
            Some(ServiceHost::Service(svc)) => svc,
            Some(ServiceHost::Instance { service, .. }) => service,
            None => return labels,
        };
        if dst.scheme == Scheme::Mirror {
            if let Some((cluster, _)) = remote_service(
                dst,
                &self.cluster_domain,
                self.remote_clusters.iter().map(String::as_str),
            ) {
                labels.insert("target_cluster".to_string(), cluster.to_string());
            }
        }
        labels.insert("service".to_string(), service.name);
        labels.insert("namespace".to_string(), service.namespace);
        labels
    }
}

#[async_trait::async_trait]
impl destination_server::Destination for DestinationServer {
    type GetStream = BoxUpdateStream;

    async fn get(
        &self,
        req: tonic::Request<api::GetDestination>,
    ) -> Result<tonic::Response<BoxUpdateStream>, tonic::Status> {
        let observer = self.get.start();
        let dst = match self.lookup(req.get_ref()) {
            Ok(dst) => dst,
            Err(status) => {
                info!(path = %req.get_ref().path, error = %status.message(), "invalid destination");
                observer.end(status.code());
                return Err(status);
            }
        };

        debug!(%dst, "subscribing");
        let labels = self.set_labels(&dst);
        let sub = self.registry.subscribe(dst);
        Ok(tonic::Response::new(response_stream(
            self.drain.clone(),
            sub,
            labels,
            observer,
        )))
    }

    type GetProfileStream = BoxProfileStream;

    async fn get_profile(
        &self,
        _req: tonic::Request<api::GetDestination>,
    ) -> Result<tonic::Response<BoxProfileStream>, tonic::Status> {
        let status = tonic::Status::unimplemented("service profiles are not served");
        self.get_profile.start().end(status.code());
        Err(status)
    }
}

fn response_stream(
    drain: drain::Watch,
    mut sub: Subscription,
    labels: HashMap<String, String>,
    observer: ResponseObserver,
) -> BoxUpdateStream {
    Box::pin(async_stream::stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let error = loop {
            let res = tokio::select! {
                res = sub.next() => res,

                // If the server starts shutting down, close the stream so that
                // it doesn't hold the server open.
                _ = &mut shutdown => return,
            };

            match res {
                Some(Ok(delta)) => {
                    for update in to_updates(&delta, &labels) {
                        observer.msg_sent();
                        yield Ok(update);
                    }
                }
                Some(Err(error)) => break error,
                None => return,
            }
        };

        let status = to_status(&error);
        debug!(dst = %sub.destination(), %error, "destination stream failed");
        observer.end(status.code());
        yield Err(status);
    })
}

fn to_status(error: &Error) -> tonic::Status {
    match error {
        Error::Unresolvable(_) => tonic::Status::invalid_argument(error.to_string()),
        Error::Resolver(_) => tonic::Status::internal(error.to_string()),
        Error::Lagged => tonic::Status::resource_exhausted(error.to_string()),
    }
}

/// Converts a delta into the updates that describe it.
///
/// Additions precede removals, and the absence of endpoints is reported
/// last.
fn to_updates(delta: &Delta, labels: &HashMap<String, String>) -> Vec<api::Update> {
    let mut updates = Vec::with_capacity(3);

    if !delta.added.is_empty() {
        updates.push(api::Update {
            update: Some(api::update::Update::Add(api::WeightedAddrSet {
                addrs: delta.added.iter().map(to_weighted_addr).collect(),
                metric_labels: labels.clone(),
            })),
        });
    }

    if !delta.removed.is_empty() {
        updates.push(api::Update {
            update: Some(api::update::Update::Remove(api::AddrSet {
                addrs: delta.removed.iter().map(|ep| ep.addr.into()).collect(),
            })),
        });
    }

    if let Some(exists) = delta.no_endpoints {
        updates.push(api::Update {
            update: Some(api::update::Update::NoEndpoints(api::NoEndpoints {
                exists,
            })),
        });
    }

    updates
}

fn to_weighted_addr(ep: &Endpoint) -> api::WeightedAddr {
    api::WeightedAddr {
        addr: Some(ep.addr.into()),
        weight: ep.weight.unwrap_or(DEFAULT_WEIGHT),
        metric_labels: ep
            .metric_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        tls_identity: ep.identity.clone().map(|name| api::TlsIdentity {
            strategy: Some(api::tls_identity::Strategy::DnsLikeIdentity(
                api::tls_identity::DnsLikeIdentity { name },
            )),
            ..Default::default()
        }),
        protocol_hint: ep.hint.map(to_protocol_hint),
        ..Default::default()
    }
}

fn to_protocol_hint(hint: Hint) -> api::ProtocolHint {
    use api::protocol_hint::{Opaque, OpaqueTransport, Protocol, H2};

    match hint {
        Hint::H2 => api::ProtocolHint {
            protocol: Some(Protocol::H2(H2 {})),
            ..Default::default()
        },
        Hint::Opaque { inbound_port } => api::ProtocolHint {
            protocol: Some(Protocol::Opaque(Opaque {})),
            opaque_transport: Some(OpaqueTransport {
                inbound_port: inbound_port.into(),
            }),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests;
