//! ---
//! pvsim_section: "01-core-functionality"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Shared primitives and utilities for the meter and PV services."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// Create a cancellation flag pair. The receiver observes `true` once shutdown is requested.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}

/// Whether shutdown has been requested.
pub fn is_cancelled(flag: &watch::Receiver<bool>) -> bool {
    *flag.borrow()
}

/// Resolve once the flag turns `true`. Never resolves if the sender is gone
/// without having requested shutdown.
pub async fn cancelled(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `duration`, returning early with `true` if shutdown is requested.
pub async fn sleep_or_cancel(duration: std::time::Duration, flag: &mut watch::Receiver<bool>) -> bool {
    if is_cancelled(flag) {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancelled(flag) => true,
    }
}

/// Spawn a task that flips the returned flag when a termination signal arrives.
pub fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = shutdown_channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn channel_starts_cleared() {
        let (tx, mut rx) = shutdown_channel();
        assert!(!*rx.borrow());
        tx.send(true).unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_shutdown() {
        let (tx, mut rx) = shutdown_channel();
        assert!(!sleep_or_cancel(Duration::from_millis(1), &mut rx).await);
        tx.send(true).unwrap();
        assert!(sleep_or_cancel(Duration::from_secs(3600), &mut rx).await);
        assert!(is_cancelled(&rx));
    }

    #[tokio::test]
    async fn dropped_sender_does_not_cancel() {
        let (tx, mut rx) = shutdown_channel();
        drop(tx);
        assert!(!sleep_or_cancel(Duration::from_millis(1), &mut rx).await);
    }
}
