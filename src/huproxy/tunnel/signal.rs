use std::{future::Future, io, sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{self, Instant},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// How far in the future a forced deadline is placed when a session is torn down.
pub const FORCED_DEADLINE: Duration = Duration::from_millis(1);

/// A settable I/O deadline for a byte stream.
///
/// Tokio sockets have no per-connection deadline, so every socket operation in a session runs
/// through [`Deadline::run`], which fails with `TimedOut` once the deadline passes. Setting a
/// deadline from another task wakes operations that are already blocked.
#[derive(Debug, Clone)]
pub struct Deadline {
    tx: Arc<watch::Sender<Option<Instant>>>,
}

impl Deadline {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, at: Instant) {
        self.tx.send_replace(Some(at));
    }

    pub fn expire_soon(&self) {
        self.set(Instant::now() + FORCED_DEADLINE);
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn run<F, T>(&self, op: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            res = op => res,
            _ = elapsed(&mut rx) => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

async fn elapsed(rx: &mut watch::Receiver<Option<Instant>>) {
    loop {
        let current = *rx.borrow_and_update();
        match current {
            Some(at) => {
                tokio::select! {
                    _ = time::sleep_until(at) => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            time::sleep_until(at).await;
                            return;
                        }
                    }
                }
            }
            None => {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// The per-session cancellation signal.
///
/// Firing is idempotent. The first fire also forces a near-immediate deadline on the session's
/// socket, since a blocked socket read cannot be cancelled any other way.
#[derive(Debug, Clone)]
pub struct Cancel {
    token: CancellationToken,
    deadline: Deadline,
}

impl Cancel {
    pub fn new(deadline: Deadline) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline,
        }
    }

    pub fn fire(&self) {
        if !self.token.is_cancelled() {
            self.token.cancel();
            self.deadline.expire_soon();
        }
    }

    pub fn fired(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
