use crate::{Destination, Emitter};
use anyhow::Result;
use std::fmt;

/// Signals a resolution to stop. Resolvers should release the signal's
/// `ReleaseShutdown` handle (or drop the watch) once they have stopped.
pub type Done = drain::Watch;

/// A strategy that turns a destination into a live sequence of endpoint
/// snapshots.
#[async_trait::async_trait]
pub trait Resolve: fmt::Debug + Send + Sync + 'static {
    /// A short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Indicates whether this strategy handles the destination.
    ///
    /// This is called to select a strategy for every new watch, so it must be
    /// cheap and must not have side effects.
    fn can_resolve(&self, dst: &Destination) -> bool;

    /// Publishes snapshots of the destination's endpoints until `done` is
    /// signaled.
    ///
    /// Transient upstream failures are handled internally. An error is
    /// returned only when the destination can never be resolved.
    async fn stream_resolution(&self, dst: Destination, emit: Emitter, done: Done)
        -> Result<()>;
}
