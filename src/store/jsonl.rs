//! JSON-lines persistence sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::PersistenceSink;
use crate::error::StoreError;
use crate::types::{NavigationReading, VehicleId};

/// One line of the output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReading {
    pub vehicle_id: VehicleId,
    #[serde(flatten)]
    pub reading: NavigationReading,
}

/// Appends each saved reading as one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    async fn save(
        &self,
        reading: &NavigationReading,
        vehicle: VehicleId,
    ) -> Result<(), StoreError> {
        let line = StoredReading {
            vehicle_id: vehicle,
            reading: reading.clone(),
        };
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');

        // One write per line under the lock keeps lines from interleaving
        let mut file = self.file.lock().await;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }
}
