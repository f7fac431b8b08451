use crate::watch::Watch;
use futures::prelude::*;
use linkerd_destination_core::{Delta, Destination, Error};
use parking_lot::Mutex;
use std::{
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

/// A subscriber's view of a watch.
///
/// Yields deltas in publication order. When the watch closes, any error that
/// closed it is yielded once before the stream ends. Dropping a subscription
/// detaches it from its watch.
#[derive(Debug)]
pub struct Subscription {
    destination: Destination,
    rx: Option<futures_mpsc_lossy::Receiver<Delta>>,
    terminal: Arc<Mutex<Option<Error>>>,
    cancel: Cancel,
}

/// Detaches a subscription from its watch.
///
/// Cancellation is idempotent and may be triggered from any task.
#[derive(Clone, Debug)]
pub struct Cancel {
    id: u64,
    watch: Weak<Watch>,
}

// === impl Subscription ===

impl Subscription {
    pub(crate) fn new(
        id: u64,
        destination: Destination,
        rx: futures_mpsc_lossy::Receiver<Delta>,
        terminal: Arc<Mutex<Option<Error>>>,
        watch: Weak<Watch>,
    ) -> Self {
        Self {
            destination,
            rx: Some(rx),
            terminal,
            cancel: Cancel { id, watch },
        }
    }

    /// Builds a subscription that yields `error` and then ends.
    pub(crate) fn terminated(destination: Destination, error: Error) -> Self {
        Self {
            destination,
            rx: None,
            terminal: Arc::new(Mutex::new(Some(error))),
            cancel: Cancel {
                id: 0,
                watch: Weak::new(),
            },
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Returns a handle that detaches this subscription.
    pub fn canceler(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Receives the next delta, or the error that closed the watch.
    ///
    /// Returns `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Result<Delta, Error>> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = Result<Delta, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(rx) = this.rx.as_mut() {
            match futures::ready!(rx.poll_recv(cx)) {
                Some(delta) => return Poll::Ready(Some(Ok(delta))),
                None => this.rx = None,
            }
        }

        // The watch records the error before closing the queue.
        Poll::Ready(this.terminal.lock().take().map(Err))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// === impl Cancel ===

impl Cancel {
    pub fn cancel(&self) {
        if let Some(watch) = self.watch.upgrade() {
            watch.detach(self.id);
        }
    }
}
