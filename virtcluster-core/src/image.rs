//! Base disk image feed
//!
//! The compressed image is cached locally. A cached copy carries the
//! remote `Last-Modified` time as its mtime and is sent back as
//! `If-Modified-Since`, so an unchanged image is never transferred twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use virtcluster_common::{Error, Result};

/// Result of a conditional fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The cached copy is current, nothing was transferred
    NotModified,
    /// A fresh copy replaced the cache
    Downloaded { bytes: u64 },
}

/// Source of the compressed base image
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Refresh `cache_path` from `url` if the remote copy is newer
    async fn fetch(&self, url: &str, cache_path: &Path) -> Result<FetchOutcome>;

    /// Decompress the cached archive into `dest`
    async fn decompress(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// HTTP feed with conditional requests and `bunzip2` decompression
#[derive(Debug, Clone)]
pub struct HttpImageFeed {
    client: reqwest::Client,
}

impl HttpImageFeed {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::System(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ImageSource for HttpImageFeed {
    async fn fetch(&self, url: &str, cache_path: &Path) -> Result<FetchOutcome> {
        let mut request = self.client.get(url);

        if let Some(modified) = cached_mtime(cache_path) {
            let since = format_http_date(modified);
            debug!("Requesting {} if modified since {}", url, since);
            request = request.header(IF_MODIFIED_SINCE, since);
        }

        let mut response = request.send().await.map_err(|e| Error::fetch(url, e))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            info!("Cached image {} is current", cache_path.display());
            return Ok(FetchOutcome::NotModified);
        }

        if !response.status().is_success() {
            return Err(Error::fetch(url, format!("HTTP {}", response.status())));
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Downloading {}", url);
        let partial = partial_path(cache_path);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut bytes = 0u64;

        while let Some(chunk) = response.chunk().await.map_err(|e| Error::fetch(url, e))? {
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, cache_path).await?;

        if let Some(modified) = last_modified {
            std::fs::File::options()
                .write(true)
                .open(cache_path)?
                .set_modified(modified)?;
        }

        info!("Downloaded {} bytes to {}", bytes, cache_path.display());
        Ok(FetchOutcome::Downloaded { bytes })
    }

    async fn decompress(&self, archive: &Path, dest: &Path) -> Result<()> {
        let output = std::fs::File::create(dest)?;

        let result = Command::new("bunzip2")
            .arg("--keep")
            .arg("--stdout")
            .arg(archive)
            .stdout(Stdio::from(output))
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let _ = std::fs::remove_file(dest);
                return Err(Error::PrerequisiteMissing(format!("bunzip2: {}", e)));
            }
        };

        if !output.status.success() {
            let _ = std::fs::remove_file(dest);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::fetch(
                archive.display().to_string(),
                format!("bunzip2 failed: {}", stderr.trim()),
            ));
        }

        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn cached_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// IMF-fixdate as used in HTTP headers
pub fn format_http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| SystemTime::from(dt.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_http_date_roundtrip() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777);
        let formatted = format_http_date(time);
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&formatted), Some(time));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/alpha-image.img.bz2")),
            PathBuf::from("/tmp/alpha-image.img.bz2.part")
        );
    }

    #[tokio::test]
    async fn test_download_sets_mtime() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/alpha/image.img.bz2");
                then.status(200)
                    .header("Last-Modified", "Sun, 06 Nov 1994 08:49:37 GMT")
                    .body("compressed-bytes");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("alpha-image.img.bz2");
        let feed = HttpImageFeed::new(Duration::from_secs(5)).unwrap();

        let outcome = feed
            .fetch(&server.url("/alpha/image.img.bz2"), &cache)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome, FetchOutcome::Downloaded { bytes: 16 });
        assert_eq!(std::fs::read_to_string(&cache).unwrap(), "compressed-bytes");
        assert_eq!(
            cached_mtime(&cache),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777))
        );
        assert!(!partial_path(&cache).exists());
    }

    #[tokio::test]
    async fn test_not_modified_transfers_nothing() {
        let server = MockServer::start_async().await;
        let conditional = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/image.img.bz2")
                    .header_exists("If-Modified-Since");
                then.status(304);
            })
            .await;
        let full = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/image.img.bz2")
                    .header_missing("If-Modified-Since");
                then.status(200).body("should not be fetched");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("image.img.bz2");
        std::fs::write(&cache, "cached").unwrap();

        let feed = HttpImageFeed::new(Duration::from_secs(5)).unwrap();
        let outcome = feed.fetch(&server.url("/image.img.bz2"), &cache).await.unwrap();

        assert_eq!(outcome, FetchOutcome::NotModified);
        conditional.assert_async().await;
        assert_eq!(full.hits_async().await, 0);
        assert_eq!(std::fs::read_to_string(&cache).unwrap(), "cached");
    }

    #[tokio::test]
    async fn test_server_error_is_fetch_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/image.img.bz2");
                then.status(503);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let feed = HttpImageFeed::new(Duration::from_secs(5)).unwrap();
        let err = feed
            .fetch(&server.url("/image.img.bz2"), &dir.path().join("image.img.bz2"))
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 5);
    }
}
