#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use linkerd_destination_core as core;
pub use linkerd_destination_grpc as grpc;
pub use linkerd_destination_k8s_index as index;
pub use linkerd_destination_registry as registry;

mod args;

pub use self::args::Args;

use std::net::IpAddr;
use tokio_stream::wrappers::WatchStream;

/// Discovers backends from a cluster's index.
#[derive(Clone, Debug)]
pub struct ClusterDiscover(index::SharedIndex);

impl ClusterDiscover {
    pub fn new(index: index::SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl core::DiscoverBackends for ClusterDiscover {
    async fn watch_service(
        &self,
        service: core::ServiceRef,
        port: u16,
    ) -> anyhow::Result<core::BackendStream> {
        let rx = self.0.write().service_rx(service, port);
        Ok(Box::pin(WatchStream::new(rx)))
    }

    async fn watch_pod(&self, pod: core::PodRef, port: u16) -> anyhow::Result<core::BackendStream> {
        let rx = self.0.write().pod_rx(pod, port);
        Ok(Box::pin(WatchStream::new(rx)))
    }

    fn lookup_ip(&self, addr: IpAddr) -> Option<core::IpTarget> {
        self.0.read().lookup_ip(addr)
    }
}
