use crate::{Destination, Endpoint};
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::watch;

/// A versioned snapshot of all known endpoints for a destination.
///
/// Snapshots are never mutated; each change produces a new snapshot with a
/// higher version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSet {
    destination: Destination,
    version: u64,
    endpoints: BTreeSet<Endpoint>,
    exists: bool,
}

/// Receives the latest snapshot published by an [`Emitter`].
pub type SnapshotRx = watch::Receiver<Option<Arc<EndpointSet>>>;

/// Publishes a resolver's snapshots, stamping each with the next version.
///
/// Snapshots are published on a watch: a consumer that falls behind observes
/// only the latest state, which is sufficient because each snapshot is
/// complete.
#[derive(Debug)]
pub struct Emitter {
    destination: Destination,
    version: u64,
    tx: watch::Sender<Option<Arc<EndpointSet>>>,
}

// === impl EndpointSet ===

impl EndpointSet {
    /// Builds a snapshot of a destination that exists.
    ///
    /// When multiple endpoints share an address, the last one wins.
    pub fn new(
        destination: Destination,
        version: u64,
        endpoints: impl IntoIterator<Item = Endpoint>,
    ) -> Self {
        let mut set = BTreeSet::new();
        for ep in endpoints {
            set.replace(ep);
        }
        Self {
            destination,
            version,
            endpoints: set,
            exists: true,
        }
    }

    /// Builds a snapshot of a destination that does not exist.
    pub fn missing(destination: Destination, version: u64) -> Self {
        Self {
            destination,
            version,
            endpoints: BTreeSet::new(),
            exists: false,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn endpoints(&self) -> &BTreeSet<Endpoint> {
        &self.endpoints
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

// === impl Emitter ===

impl Emitter {
    pub fn new(destination: Destination) -> (Self, SnapshotRx) {
        let (tx, rx) = watch::channel(None);
        let emitter = Self {
            destination,
            version: 0,
            tx,
        };
        (emitter, rx)
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Publishes the destination's current endpoints, returning the snapshot's
    /// version.
    pub fn emit(&mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> u64 {
        self.version += 1;
        let set = EndpointSet::new(self.destination.clone(), self.version, endpoints);
        self.publish(set)
    }

    /// Publishes that the destination does not exist.
    pub fn emit_missing(&mut self) -> u64 {
        self.version += 1;
        let set = EndpointSet::missing(self.destination.clone(), self.version);
        self.publish(set)
    }

    fn publish(&self, set: EndpointSet) -> u64 {
        let version = set.version;
        tracing::trace!(
            dst = %self.destination,
            version,
            endpoints = set.endpoints.len(),
            exists = set.exists,
            "publishing endpoints"
        );
        // The watch retains the value even when there are no receivers.
        self.tx.send_replace(Some(Arc::new(set)));
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheme;

    #[test]
    fn versions_increase() {
        let dst = Destination::new(Scheme::Ip, "10.1.2.3", 80);
        let (mut emit, rx) = Emitter::new(dst);
        assert!(rx.borrow().is_none());

        assert_eq!(emit.emit(Some(Endpoint::new(([10, 1, 2, 3], 80)))), 1);
        assert_eq!(emit.emit_missing(), 2);

        let last = rx.borrow().clone().expect("snapshot must be published");
        assert_eq!(last.version(), 2);
        assert!(!last.exists());
        assert!(last.is_empty());
    }

    #[test]
    fn duplicate_addresses_keep_last() {
        let dst = Destination::new(Scheme::Ip, "10.1.2.3", 80);
        let set = EndpointSet::new(
            dst,
            1,
            vec![
                Endpoint::new(([10, 1, 2, 3], 80)).with_label("pod", "old"),
                Endpoint::new(([10, 1, 2, 3], 80)).with_label("pod", "new"),
            ],
        );
        assert_eq!(set.endpoints().len(), 1);
        let ep = set.endpoints().iter().next().unwrap();
        assert_eq!(ep.metric_labels["pod"], "new");
    }
}
