//! Resolution strategies.

mod ip;
mod mirror;
mod pod;
mod service;

pub use self::{
    ip::LiteralIp,
    mirror::{remote_service, Mirror},
    pod::Pod,
    service::Service,
};
use futures::prelude::*;
use linkerd_destination_core::{
    BackendStream, Backends, Destination, Done, Emitter, Endpoint, Resolve,
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, warn};

/// An ordered list of resolution strategies. The first strategy that can
/// resolve a destination is used.
#[derive(Clone)]
pub struct Resolvers(Arc<[Arc<dyn Resolve>]>);

/// Exponential backoff for re-establishing backend watches.
#[derive(Clone, Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

// === impl Resolvers ===

impl Resolvers {
    pub fn new(resolvers: impl IntoIterator<Item = Arc<dyn Resolve>>) -> Self {
        Self(resolvers.into_iter().collect())
    }

    pub fn select(&self, dst: &Destination) -> Option<Arc<dyn Resolve>> {
        self.0.iter().find(|r| r.can_resolve(dst)).cloned()
    }
}

impl fmt::Debug for Resolvers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|r| r.name()))
            .finish()
    }
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        let min = Duration::from_millis(100);
        Self {
            min,
            max: Duration::from_secs(10),
            next: min,
        }
    }
}

impl Backoff {
    fn next(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

/// Publishes snapshots derived from a backend watch until `done` fires.
///
/// `select` maps each backend snapshot to the destination's endpoints, or to
/// `None` if the destination does not exist. If the watch cannot be
/// established or ends, it is re-established with backoff.
async fn stream_backends<W, F, S>(
    mut emit: Emitter,
    done: Done,
    watch: W,
    select: S,
) -> anyhow::Result<()>
where
    W: Fn() -> F,
    F: Future<Output = anyhow::Result<BackendStream>>,
    S: Fn(&Backends) -> Option<Vec<Endpoint>>,
{
    let shutdown = done.signaled();
    tokio::pin!(shutdown);

    let mut backoff = Backoff::default();
    loop {
        let backends = tokio::select! {
            res = watch() => res,
            _ = &mut shutdown => return Ok(()),
        };

        match backends {
            Ok(mut backends) => loop {
                tokio::select! {
                    next = backends.next() => match next {
                        Some(backends) => {
                            backoff.reset();
                            match select(&backends) {
                                Some(endpoints) => emit.emit(endpoints),
                                None => emit.emit_missing(),
                            };
                        }
                        None => {
                            debug!(dst = %emit.destination(), "backend watch ended");
                            break;
                        }
                    },
                    _ = &mut shutdown => return Ok(()),
                }
            },
            Err(error) => {
                warn!(dst = %emit.destination(), %error, "failed to watch backends");
            }
        }

        tokio::select! {
            _ = time::sleep(backoff.next()) => {}
            _ = &mut shutdown => return Ok(()),
        }
    }
}

/// Selects the ready backends of a service that exists.
fn ready(backends: &Backends) -> Option<Vec<Endpoint>> {
    backends
        .exists
        .then(|| backends.ready_endpoints().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_max() {
        let mut backoff = Backoff::default();
        let delays = (0..9).map(|_| backoff.next()).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 1600, 3200, 6400, 10_000, 10_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }
}
