#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use futures::Stream;
use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::sync::mpsc;

/// Creates a lossy multi-producer single-consumer channel.
///
/// This channel is bounded but provides no mechanism for backpressure. Though it returns
/// items that it cannot accept, it does not notify a producer of capacity availability.
///
/// This allows producers to send events on this channel without obtaining a mutable
/// reference to a sender and without ever awaiting.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let capacity = Arc::new(AtomicUsize::new(capacity));

    let s = Sender {
        tx,
        capacity: capacity.clone(),
    };

    let r = Receiver { rx, capacity };

    (s, r)
}

pub struct Receiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    capacity: Arc<AtomicUsize>,
}

pub struct Sender<T> {
    tx: mpsc::UnboundedSender<T>,
    capacity: Arc<AtomicUsize>,
}

/// Indicates that channel was not able to send an item. Subsequent items, however, may
/// be sent iff the item is `Rejected`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendError<T> {
    NoReceiver(T),
    Rejected(T),
}

// === impl Receiver ===

impl<T> Receiver<T> {
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(v)) => {
                self.capacity.fetch_add(1, Ordering::AcqRel);
                Poll::Ready(Some(v))
            }
            res => res,
        }
    }
}

impl<T> Stream for Receiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.poll_recv(cx)
    }
}

// NB: `rx` does not have a useful `Debug` impl.
impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Receiver")
            .field("capacity", &self.capacity)
            .finish()
    }
}

// === impl Sender ===

impl<T> Sender<T> {
    pub fn lossy_send(&self, v: T) -> Result<(), SendError<T>> {
        if self.tx.is_closed() {
            return Err(SendError::NoReceiver(v));
        }

        let reserved = self
            .capacity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cap| cap.checked_sub(1));
        if reserved.is_err() {
            return Err(SendError::Rejected(v));
        }

        self.tx.send(v).map_err(|mpsc::error::SendError(v)| {
            // Return the reservation so that capacity accounting stays accurate.
            self.capacity.fetch_add(1, Ordering::AcqRel);
            SendError::NoReceiver(v)
        })
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Sender")
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn rejects_when_full_and_recovers_after_recv() {
        let (tx, mut rx) = channel(2);
        assert_eq!(tx.lossy_send(1), Ok(()));
        assert_eq!(tx.lossy_send(2), Ok(()));
        assert_eq!(tx.lossy_send(3), Err(SendError::Rejected(3)));

        assert_eq!(rx.next().await, Some(1));
        assert_eq!(tx.lossy_send(4), Ok(()));
        assert_eq!(rx.next().await, Some(2));
        assert_eq!(rx.next().await, Some(4));
    }

    #[tokio::test]
    async fn closes_when_senders_drop() {
        let (tx, mut rx) = channel(1);
        tx.lossy_send("a").unwrap();
        drop(tx);
        assert_eq!(rx.next().await, Some("a"));
        assert_eq!(rx.next().await, None);
    }

    #[test]
    fn no_receiver() {
        let (tx, rx) = channel::<u8>(1);
        drop(rx);
        assert_eq!(tx.lossy_send(7), Err(SendError::NoReceiver(7)));
    }
}
