//! Turn cancellation.
//!
//! A `Canceller`/`CancelToken` pair built on a watch channel. The gateway
//! holds the canceller (firing it on client disconnect or an explicit
//! cancel); the loop holds the token and checks it at every suspension
//! point.

use tokio::sync::watch;

/// Fires cancellation for one turn.
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observed by the loop at each await point.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation fires. If the canceller is dropped
    /// without firing, this pends forever — callers race it in `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked canceller/token pair.
pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx }, CancelToken { rx })
}
