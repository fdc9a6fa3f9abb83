//! Raw calibration sample persistence
//!
//! A [`StorageSink`] is opened with a fixed set of column labels and receives
//! one row per node per sample. Sinks are best-effort: callers log write
//! failures and carry on.

mod file;
mod forward;

pub use file::FileStorage;
pub use forward::ForwardingStorage;

use crate::config::{DataStorageConfig, StorageMode};
use crate::error::StorageError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-node row sink with labels fixed at open time
#[async_trait]
pub trait StorageSink: Send {
    /// Append one row for `node`
    fn add_data(&mut self, node: &str, values: &[f64]) -> Result<(), StorageError>;

    /// Flush and release the sink. Later writes fail.
    async fn close(&mut self) -> Result<(), StorageError>;
}

/// Discards everything
pub struct NoopStorage;

#[async_trait]
impl StorageSink for NoopStorage {
    fn add_data(&mut self, _node: &str, _values: &[f64]) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Opens sinks according to `data-storage.mode`
#[derive(Debug, Clone)]
pub struct StorageFactory {
    config: DataStorageConfig,
    nodes: Vec<String>,
    started_at: i64,
}

impl StorageFactory {
    /// `started_at` is the process start as a Unix timestamp; it prefixes
    /// every file name so runs never overwrite each other.
    pub fn new(config: DataStorageConfig, nodes: Vec<String>, started_at: i64) -> Self {
        Self {
            config,
            nodes,
            started_at,
        }
    }

    /// A factory whose sinks discard everything
    pub fn disabled(nodes: Vec<String>) -> Self {
        Self::new(DataStorageConfig::default(), nodes, 0)
    }

    pub fn open(
        &self,
        name: &str,
        id: &str,
        labels: &[&str],
    ) -> Result<Box<dyn StorageSink>, StorageError> {
        debug!(mode = ?self.config.mode, name, id, "Opening data storage");

        match self.config.mode {
            StorageMode::None => Ok(Box::new(NoopStorage)),
            StorageMode::File => Ok(Box::new(self.open_file(name, id, labels)?)),
            StorageMode::Forward => {
                let file = self.open_file(name, id, labels)?;
                match &self.config.forward {
                    Some(forward) => Ok(Box::new(ForwardingStorage::new(
                        file,
                        forward.url.clone(),
                        Duration::from_secs(forward.timeout_secs),
                    )?)),
                    None => {
                        warn!("No forward target configured; keeping files locally");
                        Ok(Box::new(file))
                    }
                }
            }
        }
    }

    fn open_file(&self, name: &str, id: &str, labels: &[&str]) -> Result<FileStorage, StorageError> {
        FileStorage::open(
            self.config.directory(),
            self.started_at,
            &self.nodes,
            name,
            id,
            labels,
        )
    }
}

/// Open a sink, discarding samples if it cannot be opened
pub(crate) fn open_best_effort(
    factory: &StorageFactory,
    name: &str,
    id: &str,
    labels: &[&str],
) -> Box<dyn StorageSink> {
    factory.open(name, id, labels).unwrap_or_else(|e| {
        warn!(name, id, error = %e, "Unable to open data storage, samples will not be persisted");
        Box::new(NoopStorage)
    })
}

/// Write a row, logging instead of failing
pub(crate) fn add_best_effort(sink: &mut dyn StorageSink, node: &str, values: &[f64]) {
    if let Err(e) = sink.add_data(node, values) {
        warn!(node, error = %e, "Unable to write data to persistent storage, continuing");
    }
}

/// Close a sink, logging instead of failing
pub(crate) async fn close_best_effort(sink: &mut dyn StorageSink) {
    if let Err(e) = sink.close().await {
        warn!(error = %e, "Failed to close data storage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_disabled_factory_discards() {
        let factory = StorageFactory::disabled(vec!["n1".into()]);
        let mut sink = factory.open("idle", "power", &["power"]).unwrap();
        assert!(sink.add_data("n1", &[1.0]).is_ok());
        assert!(sink.add_data("unknown", &[1.0]).is_ok());
        assert!(sink.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_file_mode_creates_one_file_per_node() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DataStorageConfig {
            mode: StorageMode::File,
            path: Some(dir.path().to_path_buf()),
            forward: None,
        };
        let factory = StorageFactory::new(config, vec!["n1".into(), "n2".into()], 1700000000);

        let mut sink = factory.open("idle", "power", &["power"]).unwrap();
        sink.add_data("n1", &[100.0]).unwrap();
        sink.close().await.unwrap();

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("1700000000-n1-idle-power.csv"));
        assert!(files[1].ends_with("1700000000-n2-idle-power.csv"));
    }

    #[tokio::test]
    async fn test_unopenable_storage_falls_back_to_discarding() {
        let dir = tempfile::TempDir::new().unwrap();
        // a regular file where the storage directory should be
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let config = DataStorageConfig {
            mode: StorageMode::File,
            path: Some(blocker),
            forward: None,
        };
        let factory = StorageFactory::new(config, vec!["n1".into()], 1);

        assert!(factory.open("idle", "power", &["power"]).is_err());

        let mut sink = open_best_effort(&factory, "idle", "power", &["power"]);
        assert!(sink.add_data("n1", &[1.0]).is_ok());
        assert!(sink.close().await.is_ok());
    }
}
