use crate::{
    metrics::RegistryMetrics,
    subscription::Subscription,
    watch::{Phase, Watch},
    Config, Resolvers,
};
use ahash::AHashMap as HashMap;
use linkerd_destination_core::Destination;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Maps destinations to the watches that resolve them.
///
/// Cloning a registry is cheap; all clones share the same watches.
#[derive(Clone, Debug)]
pub struct Registry {
    shared: Arc<Shared>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    config: Config,
    resolvers: Resolvers,
    metrics: RegistryMetrics,
    watches: Mutex<HashMap<Destination, Arc<Watch>>>,
}

// === impl Registry ===

impl Registry {
    pub fn new(config: Config, resolvers: Resolvers, metrics: RegistryMetrics) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                resolvers,
                metrics,
                watches: Mutex::new(HashMap::default()),
            }),
        }
    }

    /// Subscribes to updates for `dst`.
    ///
    /// Concurrent subscriptions to the same destination share a single watch.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, dst: Destination) -> Subscription {
        loop {
            let watch = {
                let mut watches = self.shared.watches.lock();
                watches
                    .entry(dst.clone())
                    .or_insert_with(|| {
                        trace!(%dst, "creating watch");
                        Watch::new(
                            dst.clone(),
                            self.shared.config.clone(),
                            self.shared.resolvers.clone(),
                            Arc::downgrade(&self.shared),
                            self.shared.metrics.clone(),
                        )
                    })
                    .clone()
            };

            match watch.attach() {
                Ok(subscription) => {
                    // An unresolvable destination closes its watch immediately.
                    if watch.phase() == Phase::Closed {
                        self.shared.remove(&watch);
                    }
                    return subscription;
                }
                Err(_) => {
                    // The watch closed before it could be removed from the
                    // registry; replace it.
                    trace!(%dst, "replacing closed watch");
                    self.shared.remove(&watch);
                }
            }
        }
    }

    /// Returns the number of destinations currently being watched.
    pub fn len(&self) -> usize {
        self.shared.watches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the phase of the watch for `dst`, if one is registered.
    pub fn phase(&self, dst: &Destination) -> Option<Phase> {
        let watch = self.shared.watches.lock().get(dst).cloned()?;
        Some(watch.phase())
    }

    /// Returns the number of subscribers attached to the watch for `dst`.
    pub fn subscribers(&self, dst: &Destination) -> usize {
        let watch = self.shared.watches.lock().get(dst).cloned();
        watch.map(|w| w.subscribers()).unwrap_or(0)
    }
}

// === impl Shared ===

impl Shared {
    /// Removes `watch` from the registry if it is still the registered watch
    /// for its destination.
    pub(crate) fn remove(&self, watch: &Arc<Watch>) {
        let mut watches = self.watches.lock();
        if let Some(current) = watches.get(watch.destination()) {
            if Arc::ptr_eq(current, watch) {
                trace!(dst = %watch.destination(), "removing watch");
                watches.remove(watch.destination());
            }
        }
    }
}
