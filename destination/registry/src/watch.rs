use crate::{metrics::RegistryMetrics, registry::Shared, subscription::Subscription, Config};
use ahash::AHashMap as HashMap;
use linkerd_destination_core::{
    diff, Delta, Destination, Emitter, EndpointSet, Error, Resolve, SnapshotRx,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::{sync::Notify, time};
use tracing::{debug, info, info_span, trace, Instrument};

/// The lifecycle of a watch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No subscriber has attached yet.
    Idle,
    /// A resolver is running but has not yet published a snapshot.
    Resolving,
    /// Snapshots are being fanned out to subscribers.
    Active,
    /// The last subscriber detached; the watch closes when the linger expires.
    Draining,
    /// The watch no longer accepts subscribers.
    Closed,
}

/// Fans out a single resolution to many subscribers.
///
/// The subscriber set and the last snapshot are only read or written while
/// holding the state lock, so a subscriber's initial delta is always
/// consistent with the deltas broadcast after it.
#[derive(Debug)]
pub(crate) struct Watch {
    destination: Destination,
    config: Config,
    resolvers: crate::Resolvers,
    registry: Weak<Shared>,
    metrics: RegistryMetrics,
    state: Mutex<State>,
    idle: Notify,
}

/// Returned when attaching to a watch that has closed.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Closed(());

#[derive(Debug)]
struct State {
    phase: Phase,
    last: Option<Arc<EndpointSet>>,
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
}

#[derive(Debug)]
struct Subscriber {
    tx: futures_mpsc_lossy::Sender<Delta>,
    terminal: Arc<Mutex<Option<Error>>>,
}

/// Why a subscriber is removed while publishing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Detach {
    /// The subscriber's queue is full.
    Lagged,
    /// The subscription was dropped without detaching.
    Dropped,
}

/// Why a watch's task stopped.
enum Stop {
    /// The last subscriber detached and the linger expired.
    Idle,
    /// The resolver returned.
    Resolved(anyhow::Result<()>),
}

// === impl Watch ===

impl Watch {
    pub(crate) fn new(
        destination: Destination,
        config: Config,
        resolvers: crate::Resolvers,
        registry: Weak<Shared>,
        metrics: RegistryMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            destination,
            config,
            resolvers,
            registry,
            metrics,
            state: Mutex::new(State {
                phase: Phase::Idle,
                last: None,
                subscribers: HashMap::default(),
                next_id: 0,
            }),
            idle: Notify::new(),
        })
    }

    pub(crate) fn destination(&self) -> &Destination {
        &self.destination
    }

    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub(crate) fn subscribers(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Registers a new subscriber.
    ///
    /// The first subscriber starts the resolution. If no resolver can handle
    /// the destination, the watch closes and the returned subscription is
    /// already terminated.
    pub(crate) fn attach(self: &Arc<Self>) -> Result<Subscription, Closed> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Closed => return Err(Closed(())),

            Phase::Idle => {
                let Some(resolver) = self.resolvers.select(&self.destination) else {
                    debug!(dst = %self.destination, "no resolver matches destination");
                    state.phase = Phase::Closed;
                    self.metrics.unresolvable();
                    return Ok(Subscription::terminated(
                        self.destination.clone(),
                        Error::Unresolvable(self.destination.clone()),
                    ));
                };
                debug!(dst = %self.destination, resolver = resolver.name(), "starting resolution");
                state.phase = Phase::Resolving;
                self.metrics.watch_started(resolver.name());
                let span = info_span!("watch", dst = %self.destination, resolver = resolver.name());
                tokio::spawn(self.clone().run(resolver).instrument(span));
            }

            Phase::Draining => {
                debug!(dst = %self.destination, "reattached while draining");
                state.phase = if state.last.is_some() {
                    Phase::Active
                } else {
                    Phase::Resolving
                };
            }

            Phase::Resolving | Phase::Active => {}
        }

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = futures_mpsc_lossy::channel(self.config.subscriber_capacity.max(1));
        let terminal = Arc::new(Mutex::new(None));

        // A late subscriber's first delta describes the current state in full.
        if let Some(delta) = state.last.as_deref().and_then(|last| diff(None, last)) {
            if tx.lossy_send(delta).is_err() {
                unreachable!("a new subscriber's queue has capacity");
            }
        }

        state.subscribers.insert(
            id,
            Subscriber {
                tx,
                terminal: terminal.clone(),
            },
        );
        trace!(dst = %self.destination, id, subscribers = state.subscribers.len(), "attached");
        self.metrics.subscription_attached();

        Ok(Subscription::new(
            id,
            self.destination.clone(),
            rx,
            terminal,
            Arc::downgrade(self),
        ))
    }

    /// Removes a subscriber. Removing an unknown subscriber has no effect.
    pub(crate) fn detach(&self, id: u64) {
        let mut state = self.state.lock();
        if state.subscribers.remove(&id).is_none() {
            return;
        }
        trace!(dst = %self.destination, id, subscribers = state.subscribers.len(), "detached");
        self.metrics.subscription_detached();
        if state.subscribers.is_empty() {
            self.start_draining(&mut state);
        }
    }

    fn start_draining(&self, state: &mut State) {
        if matches!(state.phase, Phase::Resolving | Phase::Active) {
            debug!(dst = %self.destination, linger = ?self.config.linger, "draining");
            state.phase = Phase::Draining;
            self.idle.notify_one();
        }
    }

    /// Drives the resolver and fans its snapshots out until the watch closes.
    async fn run(self: Arc<Self>, resolver: Arc<dyn Resolve>) {
        let (emit, mut snapshots) = Emitter::new(self.destination.clone());
        let (signal, done) = drain::channel();
        let resolution = resolver.stream_resolution(self.destination.clone(), emit, done);
        tokio::pin!(resolution);

        let linger = time::sleep(self.config.linger);
        tokio::pin!(linger);
        let mut lingering = false;
        let mut publishing = true;

        let stop = loop {
            tokio::select! {
                biased;

                res = snapshots.changed(), if publishing => match res {
                    Ok(()) => self.publish_latest(&mut snapshots),
                    // The emitter was dropped, so the resolution is completing.
                    Err(_) => publishing = false,
                },

                res = &mut resolution => break Stop::Resolved(res),

                _ = self.idle.notified() => {
                    lingering = true;
                    linger.as_mut().reset(time::Instant::now() + self.config.linger);
                }

                _ = &mut linger, if lingering => {
                    lingering = false;
                    if self.close_if_idle() {
                        break Stop::Idle;
                    }
                }
            }
        };

        match stop {
            Stop::Idle => {
                // Stop the resolver and wait for it to release its resources.
                let (_, res) = tokio::join!(signal.drain(), resolution);
                if let Err(error) = res {
                    debug!(%error, "resolver failed while stopping");
                }
                info!("watch closed after last subscriber");
            }

            Stop::Resolved(res) => {
                drop(signal);
                // The final snapshot may not have been observed yet.
                self.publish_latest(&mut snapshots);
                let error = res.err().map(|error| {
                    info!(%error, "resolver failed");
                    Error::resolver(error)
                });
                if error.is_none() {
                    debug!("resolver completed");
                }
                self.close(error);
            }
        }

        self.deregister();
    }

    /// Diffs the latest snapshot against the last one broadcast and sends the
    /// result to all subscribers.
    fn publish_latest(&self, snapshots: &mut SnapshotRx) {
        let Some(next) = snapshots.borrow_and_update().clone() else {
            return;
        };

        let mut state = self.state.lock();
        if let Some(last) = state.last.as_ref() {
            if last.version() >= next.version() {
                return;
            }
        }

        let delta = diff(state.last.as_deref(), &next);
        trace!(version = next.version(), ?delta);
        state.last = Some(next);
        if state.phase == Phase::Resolving {
            state.phase = Phase::Active;
        }

        let Some(delta) = delta else {
            return;
        };
        self.metrics.delta_published();

        let detached = fan_out(&state.subscribers, &delta);
        if !detached.is_empty() {
            for (id, detach) in detached {
                if state.subscribers.remove(&id).is_none() {
                    continue;
                }
                match detach {
                    Detach::Lagged => self.metrics.subscription_lagged(),
                    Detach::Dropped => self.metrics.subscription_detached(),
                }
            }
            if state.subscribers.is_empty() {
                self.start_draining(&mut state);
            }
        }
    }

    /// Closes the watch if no subscriber has attached since it began draining.
    fn close_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != Phase::Draining || !state.subscribers.is_empty() {
            return false;
        }
        state.phase = Phase::Closed;
        true
    }

    /// Closes the watch, notifying all subscribers.
    fn close(&self, error: Option<Error>) {
        let subscribers = {
            let mut state = self.state.lock();
            state.phase = Phase::Closed;
            std::mem::take(&mut state.subscribers)
        };

        for (_, sub) in subscribers {
            if let Some(error) = error.as_ref() {
                *sub.terminal.lock() = Some(error.clone());
            }
            // Dropping the sender closes the subscriber's stream.
            drop(sub.tx);
            self.metrics.subscription_detached();
        }
    }

    fn deregister(self: &Arc<Self>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }
        self.metrics.watch_stopped();
    }
}

/// Sends `delta` to every subscriber, returning those that must be removed.
///
/// A lagging subscriber is told why before it is removed.
fn fan_out(subscribers: &HashMap<u64, Subscriber>, delta: &Delta) -> Vec<(u64, Detach)> {
    let mut detached = Vec::new();
    for (id, sub) in subscribers.iter() {
        match sub.tx.lossy_send(delta.clone()) {
            Ok(()) => {}
            Err(futures_mpsc_lossy::SendError::Rejected(_)) => {
                info!(id, "subscriber lagged; detaching");
                *sub.terminal.lock() = Some(Error::Lagged);
                detached.push((*id, Detach::Lagged));
            }
            Err(futures_mpsc_lossy::SendError::NoReceiver(_)) => {
                debug!(id, "subscriber dropped; detaching");
                detached.push((*id, Detach::Dropped));
            }
        }
    }
    detached
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_core::Endpoint;

    fn subscriber(capacity: usize) -> (Subscriber, futures_mpsc_lossy::Receiver<Delta>) {
        let (tx, rx) = futures_mpsc_lossy::channel(capacity);
        let sub = Subscriber {
            tx,
            terminal: Arc::default(),
        };
        (sub, rx)
    }

    #[test]
    fn dropped_subscribers_are_not_lagged() {
        let delta = Delta {
            added: [Endpoint::new(([10, 0, 0, 1], 80))].into_iter().collect(),
            ..Delta::default()
        };

        let (live, _live_rx) = subscriber(2);
        let (full, _full_rx) = subscriber(1);
        full.tx.lossy_send(delta.clone()).expect("queue must have room");
        let (dropped, dropped_rx) = subscriber(2);
        drop(dropped_rx);
        let full_terminal = full.terminal.clone();
        let dropped_terminal = dropped.terminal.clone();

        let subscribers = [(1, live), (2, full), (3, dropped)]
            .into_iter()
            .collect::<HashMap<_, _>>();
        let mut detached = fan_out(&subscribers, &delta);
        detached.sort_by_key(|(id, _)| *id);

        assert_eq!(detached, vec![(2, Detach::Lagged), (3, Detach::Dropped)]);
        assert!(matches!(*full_terminal.lock(), Some(Error::Lagged)));
        assert!(dropped_terminal.lock().is_none());
    }
}
