//! Process shutdown coordination.
//!
//! Every long running task holds a [`ShutdownLock`] clone and unlocks it
//! when it has stopped. `main` waits on [`ShutdownWait`] until all locks are
//! released. Tasks learn about shutdown through a [`ShutdownSignal`]
//! (a `watch` channel flipped on ctrl-c or by tests).

use tokio::sync::{mpsc, watch};

#[derive(Clone, Debug)]
pub struct ShutdownLock {
    _sender: mpsc::Sender<()>,
}

impl ShutdownLock {
    pub fn unlock(self) {
        tracing::debug!("shutdown lock released");
    }
}

#[derive(Debug)]
pub struct ShutdownWait {
    receiver: mpsc::Receiver<()>,
}

impl ShutdownWait {
    // returns when every lock clone has been dropped
    pub async fn wait(&mut self) {
        let _ = self.receiver.recv().await;
    }
}

pub fn create_lock_and_wait() -> (ShutdownLock, ShutdownWait) {
    let (sender, receiver) = mpsc::channel(1);
    (ShutdownLock { _sender: sender }, ShutdownWait { receiver })
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// resolves once shutdown is requested (immediately if it already was)
    pub async fn recv(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                // sender dropped: nobody can request shutdown any more
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }

    /// flip the signal on ctrl-c
    pub fn spawn_ctrl_c_listener(&self) {
        let trigger = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("ctrl-c received, shutting down");
                    trigger.shutdown();
                }
                Err(e) => tracing::error!("failed to listen for ctrl_c: {:?}", e),
            }
        });
    }
}

pub fn shutdown_signal() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, ShutdownSignal { receiver })
}
