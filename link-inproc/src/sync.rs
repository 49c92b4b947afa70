// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! One-shot broadcast signals.

use std::sync::Arc;

use tokio::sync::watch;

/// A fire-once latch observable by any number of waiters.
///
/// Firing is idempotent: the first call to [`Signal::fire`] trips the latch,
/// every subsequent call is a no-op. Cloning yields another handle onto the
/// same latch.
#[derive(Clone, Debug)]
pub(crate) struct Signal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Trip the latch. Returns `true` iff this call was the one that fired
    /// it.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the latch is fired.
    ///
    /// Resolves immediately if it already was, and never if it never is.
    pub async fn fired(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // All senders gone without firing, so: never.
                std::future::pending::<()>().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_once() {
        let sig = Signal::new();
        assert!(!sig.is_fired());
        assert!(sig.fire());
        assert!(!sig.fire());
        assert!(sig.is_fired());
        sig.fired().await
    }

    #[tokio::test]
    async fn wakes_all_waiters() {
        let sig = Signal::new();
        let waiters = (0..3).map(|_| {
            let sig = sig.clone();
            tokio::spawn(async move { sig.fired().await })
        });
        let waiters = waiters.collect::<Vec<_>>();
        sig.fire();
        for w in waiters {
            w.await.unwrap()
        }
    }
}
