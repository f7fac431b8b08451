#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod destination;
pub mod metrics;

pub use self::{destination::DestinationServer, metrics::GrpcServerMetricsFamily};
