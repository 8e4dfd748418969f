//! Cancellable event subscriptions.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// A handle on an event stream that can be cancelled from anywhere.
///
/// Once cancelled, [`recv`](Self::recv) returns `None` and keeps doing so.
pub struct Subscription<E> {
    rx: broadcast::Receiver<E>,
    cancel: CancellationToken,
}

impl<E: Clone> Subscription<E> {
    /// Wrap a broadcast receiver.
    pub fn new(rx: broadcast::Receiver<E>) -> Self {
        Self {
            rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` when cancelled or when the sender is gone. Events
    /// dropped because this subscriber fell behind are skipped with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                event = self.rx.recv() => match event {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Take an event if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        if self.cancel.is_cancelled() {
            return None;
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Stop the subscription.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the subscription has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that cancels this subscription when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
