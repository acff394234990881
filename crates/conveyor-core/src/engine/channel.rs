//! Links between stages.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::UNBOUNDED;
use crate::errors::{PipelineError, Result};

/// Sending half of a stage link.
#[derive(Debug)]
pub(crate) enum StageSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        match self {
            StageSender::Bounded(tx) => StageSender::Bounded(tx.clone()),
            StageSender::Unbounded(tx) => StageSender::Unbounded(tx.clone()),
        }
    }
}

/// Receiving half of a stage link.
#[derive(Debug)]
pub(crate) enum StageReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// A link of `capacity` slots, or an unbounded one for [`UNBOUNDED`].
pub(crate) fn stage_channel<T>(capacity: i64) -> (StageSender<T>, StageReceiver<T>) {
    if capacity == UNBOUNDED {
        let (tx, rx) = mpsc::unbounded_channel();
        (StageSender::Unbounded(tx), StageReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(usize::try_from(capacity).unwrap_or(1).max(1));
        (StageSender::Bounded(tx), StageReceiver::Bounded(rx))
    }
}

impl<T> StageSender<T> {
    /// Send `value`, waiting for room. Cancellation or a dropped receiver
    /// aborts the send with [`PipelineError::Canceled`].
    pub(crate) async fn send(&self, value: T, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Canceled);
        }
        match self {
            StageSender::Bounded(tx) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PipelineError::Canceled),
                sent = tx.send(value) => sent.map_err(|_| PipelineError::Canceled),
            },
            StageSender::Unbounded(tx) => tx.send(value).map_err(|_| PipelineError::Canceled),
        }
    }
}

impl<T> StageReceiver<T> {
    pub(crate) async fn recv(&mut self) -> Option<T> {
        match self {
            StageReceiver::Bounded(rx) => rx.recv().await,
            StageReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Receive the next value; `Ok(None)` means the upstream finished normally.
    ///
    /// A closed link observed after cancellation is reported as
    /// [`PipelineError::Canceled`], so a faulted upstream is never mistaken for
    /// a completed one.
    pub(crate) async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<T>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Canceled),
            received = self.recv() => match received {
                Some(value) => Ok(Some(value)),
                None if cancel.is_cancelled() => Err(PipelineError::Canceled),
                None => Ok(None),
            },
        }
    }
}

/// A one-way latch deciding when a downstream stage may start pulling.
#[derive(Debug, Clone)]
pub(crate) struct Gate {
    name: &'static str,
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub(crate) fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    /// Open the gate. Opening twice is harmless.
    pub(crate) fn open(&self) {
        if !self.tx.send_replace(true) {
            tracing::debug!(gate = self.name, "link established");
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Canceled),
            opened = rx.wait_for(|open| *open) => opened
                .map(|_| ())
                .map_err(|_| PipelineError::Canceled),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_send_unblocks_on_cancel() {
        let (tx, _rx) = stage_channel::<u32>(1);
        let cancel = CancellationToken::new();
        tx.send(1, &cancel).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let blocked = tx.send(2, &cancel).await;
        assert!(matches!(blocked, Err(PipelineError::Canceled)));
    }

    #[tokio::test]
    async fn test_unbounded_accepts_everything() {
        let (tx, mut rx) = stage_channel::<u32>(UNBOUNDED);
        let cancel = CancellationToken::new();
        for i in 0..1_000 {
            tx.send(i, &cancel).await.unwrap();
        }
        drop(tx);
        let mut count = 0;
        while rx.next(&cancel).await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1_000);
    }

    #[tokio::test]
    async fn test_closed_link_after_cancel_is_not_completion() {
        let (tx, mut rx) = stage_channel::<u32>(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        drop(tx);
        assert!(rx.next(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_gate_opens_waiters() {
        let gate = Gate::new("test");
        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(&cancel).await })
        };
        assert!(!gate.is_open());
        gate.open();
        gate.open();
        assert!(waiter.await.unwrap().is_ok());
        assert!(gate.is_open());
    }
}
