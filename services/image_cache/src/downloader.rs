//! Image downloader
//!
//! Simulated remote fetches behind a single-flight cache: concurrent requests
//! for the same image share one download.

use isolation_runtime::{FlightStats, Result, Runtime, RuntimeError, SingleFlight};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Bytes served for one image
pub const IMAGE_SIZE: usize = 1024;

/// A downloaded image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub key: String,
    pub bytes: Arc<Vec<u8>>,
}

impl Image {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Downloader settings
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Simulated network latency per download
    pub latency: Duration,
    /// Key whose download always fails
    pub fail_key: Option<String>,
}

#[derive(Clone)]
pub struct ImageDownloader {
    cache: SingleFlight<String, Image>,
    config: Arc<DownloaderConfig>,
    downloads: Arc<AtomicU64>,
}

impl ImageDownloader {
    pub fn new(runtime: &Runtime, config: DownloaderConfig) -> Result<Self> {
        Ok(Self {
            cache: SingleFlight::new(runtime, "image-downloader")?,
            config: Arc::new(config),
            downloads: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Image for `key`, downloading it at most once
    pub async fn fetch(&self, key: String) -> Result<Image> {
        let config = Arc::clone(&self.config);
        let downloads = Arc::clone(&self.downloads);
        let target = key.clone();
        self.cache
            .get(key, move || download(target, config, downloads))
            .await
    }

    /// Downloads actually performed
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn cache_stats(&self) -> FlightStats {
        self.cache.stats()
    }

    pub async fn cached_images(&self) -> Result<usize> {
        self.cache.len().await
    }
}

async fn download(key: String, config: Arc<DownloaderConfig>, downloads: Arc<AtomicU64>) -> Result<Image> {
    downloads.fetch_add(1, Ordering::Relaxed);
    debug!(key = %key, latency_ms = config.latency.as_millis() as u64, "Downloading image");

    tokio::time::sleep(config.latency).await;

    if config.fail_key.as_deref() == Some(key.as_str()) {
        return Err(RuntimeError::operation(format!("download of {} failed", key)));
    }

    let bytes: Vec<u8> = key.bytes().cycle().take(IMAGE_SIZE).collect();
    Ok(Image {
        key,
        bytes: Arc::new(bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloader(rt: &Runtime, fail_key: Option<&str>) -> ImageDownloader {
        ImageDownloader::new(
            rt,
            DownloaderConfig {
                latency: Duration::from_millis(100),
                fail_key: fail_key.map(str::to_string),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_fetches_download_once() {
        let rt = Runtime::builder().worker_threads(2).build().unwrap();
        let downloader = downloader(&rt, None);

        let (a, b, c) = tokio::join!(
            downloader.fetch("cat.png".to_string()),
            downloader.fetch("cat.png".to_string()),
            downloader.fetch("cat.png".to_string()),
        );

        let a = a.unwrap();
        assert_eq!(a.size(), IMAGE_SIZE);
        assert_eq!(a, b.unwrap());
        assert_eq!(a, c.unwrap());
        assert_eq!(downloader.downloads(), 1);
        assert_eq!(downloader.cached_images().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failing_key_is_not_cached() {
        let rt = Runtime::builder().worker_threads(2).build().unwrap();
        let downloader = downloader(&rt, Some("broken.png"));

        let err = downloader.fetch("broken.png".to_string()).await.unwrap_err();
        assert_eq!(err.category(), "operation");
        assert!(downloader.fetch("broken.png".to_string()).await.is_err());

        assert_eq!(downloader.downloads(), 2);
        assert_eq!(downloader.cache_stats().failures, 2);
        assert_eq!(downloader.cached_images().await.unwrap(), 0);
    }
}
