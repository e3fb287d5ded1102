//! Periodic background tasks with explicit shutdown
//!
//! Services that own a loop (stats sweeper, reminders, push heartbeat) hold a
//! [`PeriodicTask`] and stop it by sending on its shutdown channel.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A spawned loop that runs `tick` every `period` until stopped
pub struct PeriodicTask {
    name: &'static str,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn the loop. The first tick runs one full period after spawning.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // interval() completes its first tick immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!("{} task stopped", name);
        });

        info!(interval_secs = period.as_secs(), "{} task started", name);

        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal shutdown and wait for the loop to exit
    pub async fn stop(self) {
        info!("Stopping {} task", self.name);
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}
