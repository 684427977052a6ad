//! Media store collaborator and its filesystem implementation

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{ForkchatError, Result};
use crate::media::data_uri;

/// Storage backend for media bytes
///
/// `download` must fail closed: a payload larger than `max_bytes` is an
/// error, never a truncated result.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Stores `bytes` and returns a location that `download` accepts
    async fn upload(&self, bytes: &[u8], mime_type: &str) -> Result<String>;

    /// Reads the media at `location`, enforcing `max_bytes`
    async fn download(&self, location: &str, max_bytes: usize) -> Result<Vec<u8>>;
}

/// Content-addressed media store on the local filesystem
///
/// Files are named by the SHA-256 of their content, so uploading the same
/// bytes twice yields the same path. `download` additionally understands
/// `http(s)://` URLs, `file://` URLs and `data:` URIs.
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
    client: reqwest::Client,
}

impl FsMediaStore {
    /// Creates a store rooted at `root`
    ///
    /// The directory is created lazily on first upload.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            root: root.into(),
            client,
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(bytes: &[u8], mime_type: &str) -> String {
        let digest = Sha256::digest(bytes);
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}.{}", hex, extension_for(mime_type))
    }

    async fn download_http(&self, url: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ForkchatError::Media(format!("failed to fetch {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                ForkchatError::Media(format!("HTTP {} for {}", status.as_u16(), url)).into(),
            );
        }
        if let Some(len) = response.content_length() {
            check_ceiling(len as usize, max_bytes)?;
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| ForkchatError::Media(format!("read failed for {}: {}", url, e)))?;
            check_ceiling(body.len() + chunk.len(), max_bytes)?;
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn download_file(&self, path: &Path, max_bytes: usize) -> Result<Vec<u8>> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            ForkchatError::Media(format!("cannot stat {}: {}", path.display(), e))
        })?;
        check_ceiling(metadata.len() as usize, max_bytes)?;

        let bytes = tokio::fs::read(path).await?;
        // The file may have grown between stat and read
        check_ceiling(bytes.len(), max_bytes)?;
        Ok(bytes)
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn upload(&self, bytes: &[u8], mime_type: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(Self::file_name(bytes, mime_type));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(path = %path.display(), "Media already stored");
        } else {
            tokio::fs::write(&path, bytes).await?;
            tracing::debug!(path = %path.display(), size = bytes.len(), "Stored media");
        }
        Ok(path.to_string_lossy().into_owned())
    }

    async fn download(&self, location: &str, max_bytes: usize) -> Result<Vec<u8>> {
        if location.starts_with("data:") {
            let (bytes, _) = data_uri::decode(location)?;
            check_ceiling(bytes.len(), max_bytes)?;
            return Ok(bytes);
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            return self.download_http(location, max_bytes).await;
        }
        if location.starts_with("file://") {
            let path = Url::parse(location)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .ok_or_else(|| ForkchatError::Media(format!("invalid file URL: {}", location)))?;
            return self.download_file(&path, max_bytes).await;
        }
        self.download_file(Path::new(location), max_bytes).await
    }
}

fn check_ceiling(actual: usize, limit: usize) -> Result<()> {
    if actual > limit {
        return Err(ForkchatError::MediaTooLarge { limit, actual }.into());
    }
    Ok(())
}

/// File extension for a MIME type, `bin` when unknown
pub fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
}

/// Guesses a MIME type from a path or URL extension
pub fn mime_from_path(path: &str) -> &'static str {
    let ext = path
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_upload_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = FsMediaStore::new(dir.path().join("media"));

        let first = store.upload(b"pixels", "image/png").await.unwrap();
        let second = store.upload(b"pixels", "image/png").await.unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with(".png"));

        let bytes = store.download(&first, 1024).await.unwrap();
        assert_eq!(bytes, b"pixels");
    }

    #[tokio::test]
    async fn test_download_enforces_ceiling_for_files() {
        let dir = TempDir::new().unwrap();
        let store = FsMediaStore::new(dir.path());
        let location = store.upload(&[0u8; 64], "image/png").await.unwrap();

        let err = store.download(&location, 10).await.unwrap_err();
        match err.downcast_ref::<ForkchatError>() {
            Some(ForkchatError::MediaTooLarge { limit, actual }) => {
                assert_eq!(*limit, 10);
                assert_eq!(*actual, 64);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_file_url_and_data_uri() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let store = FsMediaStore::new(dir.path());

        let url = Url::from_file_path(&file).unwrap().to_string();
        assert_eq!(store.download(&url, 100).await.unwrap(), b"hello");

        let uri = data_uri::encode(b"inline", "text/plain");
        assert_eq!(store.download(&uri, 100).await.unwrap(), b"inline");
        assert!(store.download(&uri, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_download_http_with_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 32]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = FsMediaStore::new(std::env::temp_dir());
        let url = format!("{}/img.png", server.uri());
        assert_eq!(store.download(&url, 32).await.unwrap().len(), 32);
        assert!(store.download(&url, 16).await.is_err());

        let missing = format!("{}/missing.png", server.uri());
        assert!(store.download(&missing, 32).await.is_err());
    }

    #[test]
    fn test_mime_helpers() {
        assert_eq!(mime_from_path("/tmp/Photo.JPG"), "image/jpeg");
        assert_eq!(mime_from_path("noext"), "application/octet-stream");
        assert_eq!(extension_for("video/mp4"), "mp4");
        assert_eq!(extension_for("application/x-unknown"), "bin");
    }
}
