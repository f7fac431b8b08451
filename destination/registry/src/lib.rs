//! Multiplexes destination subscriptions onto shared resolutions.
//!
//! The [`Registry`] maintains one watch per distinct [`Destination`]. A watch
//! selects the first resolver that can handle its destination, drives that
//! resolver on a dedicated task, and fans the resolver's snapshots out to
//! every attached [`Subscription`] as minimal deltas:
//!
//! ```text
//! [ Registry ] -> [ Watch ] -> [ Resolve ] -> EndpointSet
//!                     |
//!                     +-- diff --> [ Subscription ] ...
//! ```
//!
//! A watch outlives its last subscription by a configurable linger period so
//! that reconnecting clients do not restart the resolution.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod registry;
pub mod resolve;
mod subscription;
mod watch;


pub use self::{
    metrics::RegistryMetrics,
    registry::Registry,
    resolve::Resolvers,
    subscription::{Cancel, Subscription},
    watch::Phase,
};
pub use linkerd_destination_core::{Delta, Destination, Error};
use std::time::Duration;

/// Configures watch fan-out.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long a watch remains active after its last subscriber detaches.
    pub linger: Duration,

    /// The number of deltas buffered for each subscriber. A subscriber that
    /// falls further behind is detached.
    pub subscriber_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            linger: Duration::from_secs(5),
            subscriber_capacity: 100,
        }
    }
}
