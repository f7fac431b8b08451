use super::*;
use destination_server::Destination as _;
use linkerd2_proxy_api::net;
use linkerd_destination_core::{Done, Emitter, Resolve};
use linkerd_destination_registry::{resolve::LiteralIp, Config, RegistryMetrics, Resolvers};
use maplit::{convert_args, hashmap};
use pretty_assertions::assert_eq;
use std::{collections::BTreeSet, net::SocketAddr};

/// Fails every resolution.
#[derive(Debug)]
struct Broken;

#[async_trait::async_trait]
impl Resolve for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn can_resolve(&self, dst: &Destination) -> bool {
        dst.path.starts_with("broken.")
    }

    async fn stream_resolution(&self, _: Destination, _: Emitter, _: Done) -> anyhow::Result<()> {
        anyhow::bail!("the cluster is on fire")
    }
}

fn resolvers(resolver: impl Resolve) -> Resolvers {
    Resolvers::new([Arc::new(resolver) as Arc<dyn Resolve>])
}

fn mk_server(resolvers: Resolvers) -> (drain::Signal, DestinationServer) {
    let (signal, drain) = drain::channel();
    let registry = Registry::new(Config::default(), resolvers, RegistryMetrics::default());
    let metrics =
        GrpcServerMetricsFamily::register(&mut prometheus_client::registry::Registry::default());
    let server = DestinationServer::new(
        registry,
        "cluster.local",
        ["east".to_string(), "us-east".to_string()],
        metrics,
        drain,
    );
    (signal, server)
}

fn get(scheme: &str, path: &str) -> api::GetDestination {
    api::GetDestination {
        scheme: scheme.to_string(),
        path: path.to_string(),
        ..Default::default()
    }
}

fn tcp(addr: &str) -> net::TcpAddress {
    addr.parse::<SocketAddr>().unwrap().into()
}

fn ep(addr: &str) -> Endpoint {
    Endpoint::new(addr.parse::<SocketAddr>().unwrap())
}

#[test]
fn parses_authorities() {
    let (_signal, server) = mk_server(Resolvers::new(None));

    assert_eq!(
        server
            .lookup(&get("k8s", "web.ns.svc.cluster.local:8080"))
            .unwrap(),
        Destination::new(Scheme::Service, "web.ns.svc.cluster.local", 8080)
    );
    assert_eq!(
        server.lookup(&get("k8s", "web.ns.svc.cluster.local")).unwrap(),
        Destination::new(Scheme::Service, "web.ns.svc.cluster.local", 80)
    );
    assert_eq!(
        server.lookup(&get("k8s", "Web.NS.svc.cluster.local:80")).unwrap(),
        Destination::new(Scheme::Service, "web.ns.svc.cluster.local", 80)
    );
    assert_eq!(
        server
            .lookup(&get("k8s", "web.ns.svc.cluster.local.:8080"))
            .unwrap(),
        Destination::new(Scheme::Service, "web.ns.svc.cluster.local", 8080)
    );
    assert_eq!(
        server.lookup(&get("k8s", "10.1.2.3:8080")).unwrap(),
        Destination::new(Scheme::Ip, "10.1.2.3", 8080)
    );
    assert_eq!(
        server.lookup(&get("k8s", "[2001:db8::1]:8080")).unwrap(),
        Destination::new(Scheme::Ip, "[2001:db8::1]", 8080)
    );
    assert_eq!(
        server
            .lookup(&get("mirror", "web-east.ns.svc.cluster.local:8080"))
            .unwrap(),
        Destination::new(Scheme::Mirror, "web-east.ns.svc.cluster.local", 8080)
    );
}

#[test]
fn rejects_invalid_requests() {
    let (_signal, server) = mk_server(Resolvers::new(None));
    for (scheme, path) in [
        ("http", "web.ns.svc.cluster.local:80"),
        ("k8s", "not a valid authority"),
        ("k8s", ":8080"),
        ("k8s", ".:8080"),
    ] {
        let status = server
            .lookup(&get(scheme, path))
            .expect_err("request must be rejected");
        assert_eq!(status.code(), tonic::Code::InvalidArgument, "{scheme} {path}");
    }
}

#[test]
fn labels_service_sets() {
    let (_signal, server) = mk_server(Resolvers::new(None));

    let svc = Destination::new(Scheme::Service, "web.ns.svc.cluster.local", 80);
    assert_eq!(
        server.set_labels(&svc),
        convert_args!(hashmap!(
            "service" => "web",
            "namespace" => "ns",
        ))
    );

    let mirror = Destination::new(Scheme::Mirror, "web-us-east.ns.svc.cluster.local", 80);
    assert_eq!(
        server.set_labels(&mirror),
        convert_args!(hashmap!(
            "service" => "web-us-east",
            "namespace" => "ns",
            "target_cluster" => "us-east",
        ))
    );

    let ip = Destination::new(Scheme::Ip, "10.1.2.3", 80);
    assert!(server.set_labels(&ip).is_empty());
}

#[test]
fn churn_adds_before_removing() {
    let labels = convert_args!(hashmap!("service" => "web", "namespace" => "ns"));
    let delta = Delta {
        added: BTreeSet::from([ep("10.0.0.3:80")]),
        removed: BTreeSet::from([ep("10.0.0.1:80")]),
        no_endpoints: None,
    };

    let updates = to_updates(&delta, &labels);
    assert_eq!(updates.len(), 2);
    match &updates[0].update {
        Some(api::update::Update::Add(set)) => {
            assert_eq!(set.metric_labels, labels);
            assert_eq!(set.addrs.len(), 1);
            assert_eq!(set.addrs[0].addr, Some(tcp("10.0.0.3:80")));
        }
        update => panic!("unexpected update: {update:?}"),
    }
    assert_eq!(
        updates[1].update,
        Some(api::update::Update::Remove(api::AddrSet {
            addrs: vec![tcp("10.0.0.1:80")],
        }))
    );
}

#[test]
fn losing_all_endpoints_reports_no_endpoints() {
    let delta = Delta {
        removed: BTreeSet::from([ep("10.0.0.1:80"), ep("10.0.0.2:80")]),
        no_endpoints: Some(true),
        ..Delta::default()
    };

    let updates = to_updates(&delta, &HashMap::new());
    assert_eq!(
        updates
            .into_iter()
            .map(|u| u.update)
            .collect::<Vec<_>>(),
        vec![
            Some(api::update::Update::Remove(api::AddrSet {
                addrs: vec![tcp("10.0.0.1:80"), tcp("10.0.0.2:80")],
            })),
            Some(api::update::Update::NoEndpoints(api::NoEndpoints {
                exists: true
            })),
        ]
    );
}

#[test]
fn encodes_endpoint_metadata() {
    let mut endpoint = ep("10.0.0.1:3306")
        .with_identity("web.ns.serviceaccount.identity.linkerd.cluster.local")
        .with_label("pod", "web-0");
    endpoint.hint = Some(Hint::Opaque { inbound_port: 4143 });

    let addr = to_weighted_addr(&endpoint);
    assert_eq!(addr.addr, Some(tcp("10.0.0.1:3306")));
    assert_eq!(addr.weight, DEFAULT_WEIGHT);
    assert_eq!(addr.metric_labels, convert_args!(hashmap!("pod" => "web-0")));
    assert_eq!(
        addr.tls_identity.and_then(|id| id.strategy),
        Some(api::tls_identity::Strategy::DnsLikeIdentity(
            api::tls_identity::DnsLikeIdentity {
                name: "web.ns.serviceaccount.identity.linkerd.cluster.local".to_string(),
            }
        ))
    );
    let hint = addr.protocol_hint.expect("meshed endpoints must have a hint");
    assert_eq!(
        hint.protocol,
        Some(api::protocol_hint::Protocol::Opaque(
            api::protocol_hint::Opaque {}
        ))
    );
    assert_eq!(
        hint.opaque_transport,
        Some(api::protocol_hint::OpaqueTransport { inbound_port: 4143 })
    );

    let plain = to_weighted_addr(&ep("10.0.0.2:80"));
    assert_eq!(plain.tls_identity, None);
    assert_eq!(plain.protocol_hint, None);
}

#[tokio::test]
async fn streams_literal_ips() {
    let (signal, server) = mk_server(resolvers(LiteralIp::default()));

    let mut updates = server
        .get(tonic::Request::new(get("k8s", "10.1.2.3:8080")))
        .await
        .expect("request must succeed")
        .into_inner();
    match updates.next().await {
        Some(Ok(api::Update {
            update: Some(api::update::Update::Add(set)),
        })) => {
            assert_eq!(
                set.addrs
                    .into_iter()
                    .map(|a| a.addr)
                    .collect::<Vec<_>>(),
                vec![Some(tcp("10.1.2.3:8080"))]
            );
            assert!(set.metric_labels.is_empty());
        }
        res => panic!("unexpected update: {res:?}"),
    }

    // Nothing follows the initial address.
    let next = tokio::time::timeout(std::time::Duration::from_millis(100), updates.next()).await;
    assert!(next.is_err(), "unexpected update: {next:?}");

    // Streams close when the server shuts down.
    drop(server);
    tokio::join!(signal.drain(), async move {
        assert!(updates.next().await.is_none());
    });
}

#[tokio::test]
async fn unresolvable_destinations_are_invalid() {
    let (_signal, server) = mk_server(Resolvers::new(None));

    let mut updates = server
        .get(tonic::Request::new(get("k8s", "web.ns.svc.cluster.local:80")))
        .await
        .expect("request must succeed")
        .into_inner();
    let status = updates
        .next()
        .await
        .expect("stream must yield an error")
        .expect_err("stream must fail");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(updates.next().await.is_none());
}

#[tokio::test]
async fn resolver_failures_are_internal() {
    let (_signal, server) = mk_server(resolvers(Broken));

    let mut updates = server
        .get(tonic::Request::new(get("k8s", "broken.ns.svc.cluster.local:80")))
        .await
        .expect("request must succeed")
        .into_inner();
    let status = updates
        .next()
        .await
        .expect("stream must yield an error")
        .expect_err("stream must fail");
    assert_eq!(status.code(), tonic::Code::Internal);
    assert!(updates.next().await.is_none());
}

#[tokio::test]
async fn profiles_are_unimplemented() {
    let (_signal, server) = mk_server(Resolvers::new(None));
    let status = server
        .get_profile(tonic::Request::new(get("k8s", "web.ns.svc.cluster.local:80")))
        .await
        .err()
        .expect("profiles must not be served");
    assert_eq!(status.code(), tonic::Code::Unimplemented);
}
