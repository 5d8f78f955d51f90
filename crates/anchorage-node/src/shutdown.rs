//! Graceful shutdown helper.

use tokio::{
    signal::unix::{signal, SignalKind},
    sync::broadcast,
};
use tracing::{error, info};

/// Manages graceful shutdown by listening for SIGTERM and SIGINT signals
/// and broadcasting shutdown notifications to subscribers
pub struct Shutdown {
    tx_shutdown: broadcast::Sender<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        let (tx_shutdown, _) = broadcast::channel(1);
        Self { tx_shutdown }
    }
}

impl Shutdown {
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx_shutdown.subscribe()
    }

    async fn run_inner(&self) -> Result<(), std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
        };
        Ok(())
    }

    pub async fn run(&self) -> Result<(), ()> {
        let res = self.run_inner().await;
        if let Err(err) = &res {
            error!("Failed to listen for shutdown signals: {}", err);
        }
        // Other components are stopped in both cases
        let sent = self.tx_shutdown.send(());
        match (res, sent) {
            (Ok(()), Ok(_)) => Ok(()),
            _ => Err(()),
        }
    }
}
