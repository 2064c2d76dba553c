//! Audio asset retrieval into a job's scratch directory.

use futures_util::StreamExt;
use reqwest::Url;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum AssetDownloadError {
    #[error("unsupported audio source {0:?}")]
    UnsupportedSource(String),

    #[error("request for {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("audio source {0} is empty")]
    Empty(String),

    #[error("audio preparation cancelled")]
    Cancelled,
}

/// Retrieves the bytes behind a source URI into a local file.
#[async_trait::async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, src: &str, dest: &Path) -> Result<(), AssetDownloadError>;
}

/// Fetcher for `http(s)://`, `file://` and plain filesystem paths.
#[derive(Debug, Clone, Default)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), AssetDownloadError> {
        let http = |source| AssetDownloadError::Http {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http)?;

        let mut file = fs::File::create(dest).await.map_err(|source| io_at(dest, source))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let data = chunk.map_err(http)?;
            file.write_all(&data)
                .await
                .map_err(|source| io_at(dest, source))?;
        }
        file.flush().await.map_err(|source| io_at(dest, source))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, src: &str, dest: &Path) -> Result<(), AssetDownloadError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| io_at(parent, source))?;
        }

        match classify_source(src)? {
            Source::Remote(url) => self.download(&url, dest).await?,
            Source::Local(path) => {
                fs::copy(&path, dest)
                    .await
                    .map_err(|source| io_at(&path, source))?;
            }
        }

        let len = fs::metadata(dest)
            .await
            .map_err(|source| io_at(dest, source))?
            .len();
        if len == 0 {
            return Err(AssetDownloadError::Empty(src.to_string()));
        }
        tracing::debug!(src, dest = %dest.display(), bytes = len, "audio asset fetched");
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum Source {
    Remote(String),
    Local(PathBuf),
}

fn classify_source(src: &str) -> Result<Source, AssetDownloadError> {
    let src = src.trim();
    if src.is_empty() {
        return Err(AssetDownloadError::UnsupportedSource(src.to_string()));
    }
    match Url::parse(src) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(Source::Remote(url.to_string())),
            "file" => url
                .to_file_path()
                .map(Source::Local)
                .map_err(|_| AssetDownloadError::UnsupportedSource(src.to_string())),
            // Windows drive letters parse as a one-letter scheme
            scheme if scheme.len() == 1 => Ok(Source::Local(PathBuf::from(src))),
            _ => Err(AssetDownloadError::UnsupportedSource(src.to_string())),
        },
        Err(_) => Ok(Source::Local(PathBuf::from(src))),
    }
}

fn io_at(path: &Path, source: std::io::Error) -> AssetDownloadError {
    AssetDownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_source() {
        assert_eq!(
            classify_source("https://cdn.example.com/a.mp3").unwrap(),
            Source::Remote("https://cdn.example.com/a.mp3".to_string())
        );
        assert_eq!(
            classify_source("/media/a.wav").unwrap(),
            Source::Local(PathBuf::from("/media/a.wav"))
        );
        assert!(matches!(
            classify_source("ftp://host/a.mp3"),
            Err(AssetDownloadError::UnsupportedSource(_))
        ));
        assert!(matches!(
            classify_source("   "),
            Err(AssetDownloadError::UnsupportedSource(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_url_maps_to_path() {
        assert_eq!(
            classify_source("file:///media/a.wav").unwrap(),
            Source::Local(PathBuf::from("/media/a.wav"))
        );
    }

    #[tokio::test]
    async fn test_local_path_is_copied() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("music.mp3");
        std::fs::write(&src, b"ID3 audio bytes").unwrap();
        let dest = dir.path().join("job").join("audio").join("track-0.mp3");

        HttpAssetFetcher::default()
            .fetch(src.to_str().unwrap(), &dest)
            .await
            .expect("copy succeeds");
        assert_eq!(std::fs::read(&dest).unwrap(), b"ID3 audio bytes");
    }

    #[tokio::test]
    async fn test_missing_and_empty_sources_fail() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.mp3");

        let err = HttpAssetFetcher::default()
            .fetch("/definitely/not/here.mp3", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, AssetDownloadError::Io { .. }));

        let empty = dir.path().join("empty.mp3");
        std::fs::write(&empty, b"").unwrap();
        let err = HttpAssetFetcher::default()
            .fetch(empty.to_str().unwrap(), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, AssetDownloadError::Empty(_)));
    }
}
