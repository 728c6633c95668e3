// SPDX-License-Identifier: Apache-2.0

//! Bounded MPMC channel used between tailer stages.
//!
//! Async senders suspend while the channel is full, which is how a slow
//! consumer pushes back on a file reader. Threads that must never block
//! (filesystem notification callbacks) use [`BoundedSender::try_send`].

use flume::{Receiver, Sender, TrySendError as FlumeTrySendError};
use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

impl<T> BoundedSender<T> {
    /// Waits for capacity, then enqueues the item.
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        self.tx
            .send_async(item)
            .await
            .map_err(|_| SendError::Disconnected)
    }

    /// Enqueues without waiting, handing the item back when there is no room.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            FlumeTrySendError::Full(item) => TrySendError::Full(item),
            FlumeTrySendError::Disconnected(item) => TrySendError::Disconnected(item),
        })
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Next item, or `None` once every sender is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive. `None` when empty or disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    (BoundedSender { tx }, BoundedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::{SendError, TrySendError, bounded};
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn receive_after_send() {
        let (tx, mut rx) = bounded(3);

        let mut recv1 = spawn(async { rx.next().await });
        assert_pending!(recv1.poll());

        let mut send1 = spawn(async { tx.send(7u64).await });
        assert_ok!(assert_ready!(send1.poll()));

        assert!(recv1.is_woken());
        assert_eq!(Some(7), assert_ready!(recv1.poll()));
        drop(recv1);
        drop(send1);

        drop(tx);
        let mut recv2 = spawn(async { rx.next().await });
        assert_eq!(None, assert_ready!(recv2.poll()));
    }

    #[tokio::test]
    async fn full_channel_suspends_sender() {
        let (tx, mut rx) = bounded(1);

        let mut send1 = spawn(async { tx.send("a").await });
        assert_ok!(assert_ready!(send1.poll()));
        drop(send1);

        let mut send2 = spawn(async { tx.send("b").await });
        assert_pending!(send2.poll());

        let mut recv = spawn(async { rx.next().await });
        assert_eq!(Some("a"), assert_ready!(recv.poll()));
        drop(recv);

        assert_ok!(assert_ready!(send2.poll()));
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = bounded(1);
        drop(rx);

        let mut send1 = spawn(async { tx.send(1).await });
        assert_eq!(Err(SendError::Disconnected), assert_ready!(send1.poll()));
    }

    #[test]
    fn try_send_reports_full_and_disconnected() {
        let (tx, rx) = bounded(1);

        assert_eq!(Ok(()), tx.try_send(1));
        assert_eq!(Err(TrySendError::Full(2)), tx.try_send(2));
        assert_eq!(Some(1), rx.try_recv());
        assert!(rx.is_empty());

        drop(rx);
        assert_eq!(Err(TrySendError::Disconnected(3)), tx.try_send(3));
    }
}
