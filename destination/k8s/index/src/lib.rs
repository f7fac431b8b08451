//! Indexes Kubernetes discovery state for destination resolution.
//!
//! The index watches the following cluster resources:
//!
//! - Each `Service` enumerates its ports and cluster IPs. A service may be
//!   annotated with the ports that should be treated as opaque.
//! - Each `EndpointSlice` is linked to its service by the
//!   `kubernetes.io/service-name` label and lists the service's backend
//!   addresses with their readiness.
//! - Each `Pod` provides the metadata published with its endpoints: its mesh
//!   identity, its workload labels, and its protocol hints.
//!
//! ```text
//! [ Service ] <- [ EndpointSlice ] -> [ Pod ]
//! ```
//!
//! Lookups against the index are initiated for a single service-port or
//! pod-port. Each is modeled as a watch that is updated with a complete
//! snapshot of its backends whenever any resource that contributes to it
//! changes.
//!
//! All resources are scoped within a namespace index, as services only select
//! endpoints in their own namespace.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_info;
mod index;
pub mod metrics;
mod pod;
pub mod ports;


pub use self::{
    cluster_info::ClusterInfo,
    index::{Index, SharedIndex},
    metrics::{IndexMetrics, IndexMetricsFamily},
};
