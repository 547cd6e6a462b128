//! Arrêt coopératif des boucles de fond (réconciliation, poller).
//!
//! Le drapeau n'est consulté qu'entre deux cycles ou pendant la pause :
//! un appel réseau en cours n'est jamais interrompu.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LoopHandle {
    pub fn new(stop_tx: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self { stop_tx, join }
    }

    /// Demande l'arrêt; le cycle en cours se termine normalement
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.stop();
        let _ = self.join.await;
    }
}

pub fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub fn stop_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Dort `period`; renvoie `true` si l'arrêt a été demandé entre-temps
pub async fn sleep_or_stop(rx: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if stop_requested(rx) {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => stop_requested(rx),
        changed = rx.changed() => changed.is_err() || stop_requested(rx),
    }
}
