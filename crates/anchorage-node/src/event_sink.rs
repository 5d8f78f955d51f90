//! File sink appending prover events as JSON lines.

use std::path::PathBuf;

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use anchorage_prover::ProverEvent;

/// Sink for writing prover events to a JSON lines file
pub struct EventSink {
    path: PathBuf,
}

impl EventSink {
    /// Create a new event sink, creating the parent directory if it doesn't exist
    pub async fn new(path: PathBuf) -> Result<Self, anyhow::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        info!("EventSink initialized with path: {:?}", path);
        Ok(Self { path })
    }

    /// Append events in emission order, one JSON object per line
    pub async fn write_events(&mut self, events: &[ProverEvent]) -> Result<(), anyhow::Error> {
        if events.is_empty() {
            return Ok(());
        }

        let mut content = String::new();
        for event in events {
            content.push_str(&serde_json::to_string(event)?);
            content.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        debug!("{} events written to {:?}", events.len(), self.path);
        Ok(())
    }
}
