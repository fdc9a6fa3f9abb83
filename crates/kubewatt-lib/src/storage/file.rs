use super::StorageSink;
use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One CSV file per node, named `<started_at>-<node>-<name>-<id>.csv`,
/// starting with a header row of the labels
pub struct FileStorage {
    labels: usize,
    writers: HashMap<String, csv::Writer<File>>,
    paths: Vec<PathBuf>,
}

impl FileStorage {
    pub fn open(
        directory: &Path,
        started_at: i64,
        nodes: &[String],
        name: &str,
        id: &str,
        labels: &[&str],
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(directory)?;

        let mut writers = HashMap::with_capacity(nodes.len());
        let mut paths = Vec::with_capacity(nodes.len());
        for node in nodes {
            let path = directory.join(format!("{started_at}-{node}-{name}-{id}.csv"));
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(labels)?;
            writer.flush()?;
            writers.insert(node.clone(), writer);
            paths.push(path);
        }

        Ok(Self {
            labels: labels.len(),
            writers,
            paths,
        })
    }

    /// Files written by this sink, in node order
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

#[async_trait]
impl StorageSink for FileStorage {
    fn add_data(&mut self, node: &str, values: &[f64]) -> Result<(), StorageError> {
        let writer = self
            .writers
            .get_mut(node)
            .ok_or_else(|| StorageError::UnknownNode(node.to_string()))?;

        let mut row = values.to_vec();
        if row.len() < self.labels {
            warn!(node, values = row.len(), labels = self.labels, "Row is shorter than labels, padding with zeroes");
        } else if row.len() > self.labels {
            warn!(node, values = row.len(), labels = self.labels, "Row is longer than labels, ignoring overflow");
        }
        row.resize(self.labels, 0.0);

        writer.write_record(row.iter().map(|v| v.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        for (_, mut writer) in self.writers.drain() {
            writer.flush()?;
        }
        Ok(())
    }
}
