use log::{info, warn};
use std::future::Future;
use std::io;
use tokio::sync::watch;

/// Fires the process-wide cancellation signal.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable view of the cancellation signal handed to every task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered. A dropped trigger counts as shutdown.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Triggers shutdown on ctrl-c or SIGTERM. If neither handler can be installed the
/// process keeps running until killed.
pub async fn wait_for_signal(trigger: ShutdownTrigger) {
    let ctrl_c = listen("ctrl-c", tokio::signal::ctrl_c());

    #[cfg(unix)]
    let terminate = listen("SIGTERM", async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())?.recv().await;
        Ok::<(), io::Error>(())
    });
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown requested");
    trigger.trigger();
}

/// Resolves when `signal` fires. A handler that fails to install never resolves.
async fn listen<F>(name: &str, signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!("{} handler unavailable: {}", name, e);
        std::future::pending::<()>().await;
    }
}
