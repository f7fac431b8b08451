//! Core types for destination resolution.
//!
//! A [`Destination`] names something a client wants to reach. A [`Resolve`]
//! strategy turns a destination into a live sequence of versioned
//! [`EndpointSet`] snapshots, and [`diff`] reduces successive snapshots to the
//! minimal [`Delta`] that subscribers need to observe.
//!
//! Resolvers that depend on cluster state consume it through the
//! [`DiscoverBackends`] trait, which is implemented outside of this crate
//! (e.g. by a Kubernetes index).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backends;
mod delta;
mod destination;
mod endpoint;
mod endpoint_set;
mod error;
mod resolve;

pub use self::{
    backends::{BackendRecord, BackendStream, Backends, DiscoverBackends, IpTarget, PodRef},
    delta::{diff, Delta},
    destination::{Destination, Scheme, ServiceHost, ServiceRef},
    endpoint::{Endpoint, Hint},
    endpoint_set::{EndpointSet, Emitter, SnapshotRx},
    error::Error,
    resolve::{Done, Resolve},
};
