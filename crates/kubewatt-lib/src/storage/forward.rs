use super::{FileStorage, StorageSink};
use crate::error::StorageError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info};

/// Writes through a [`FileStorage`] and POSTs each finished file to a
/// collection endpoint when closed.
///
/// Upload failures are logged and never reported to the caller; the local
/// files stay behind either way.
pub struct ForwardingStorage {
    inner: FileStorage,
    url: String,
    client: reqwest::Client,
}

impl ForwardingStorage {
    pub fn new(inner: FileStorage, url: String, timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { inner, url, client })
    }

    async fn forward(&self) {
        for path in self.inner.paths() {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let body = match tokio::fs::read(path).await {
                Ok(body) => body,
                Err(e) => {
                    error!(file = %path.display(), error = %e, "Unable to read data file for forwarding");
                    continue;
                }
            };

            let result = self
                .client
                .post(&self.url)
                .header("Content-Type", "text/csv")
                .header("Content-Disposition", format!("attachment; filename=\"{filename}\""))
                .body(body)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(_) => info!(file = %filename, url = %self.url, "Forwarded data file"),
                Err(e) => error!(
                    file = %filename,
                    url = %self.url,
                    error = %e,
                    "Unable to forward data file, not considering this fatal"
                ),
            }
        }
    }
}

#[async_trait]
impl StorageSink for ForwardingStorage {
    fn add_data(&mut self, node: &str, values: &[f64]) -> Result<(), StorageError> {
        self.inner.add_data(node, values)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.inner.close().await?;
        self.forward().await;
        Ok(())
    }
}
