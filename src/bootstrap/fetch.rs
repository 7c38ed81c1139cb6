//! Archive download and extraction

use crate::config::ArchiveType;
use crate::logging::LogSink;
use crate::types::LspError;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

/// Fetches an archive and unpacks it into a directory
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch_and_extract(
        &self,
        url: &str,
        destination: &Path,
        archive_type: ArchiveType,
    ) -> Result<(), LspError>;
}

/// Downloads over HTTP(S) with reqwest
pub struct HttpArchiveFetcher {
    client: reqwest::Client,
    logger: Arc<dyn LogSink>,
}

impl HttpArchiveFetcher {
    pub fn new(logger: Arc<dyn LogSink>) -> Self {
        Self::with_client(reqwest::Client::new(), logger)
    }

    pub fn with_client(client: reqwest::Client, logger: Arc<dyn LogSink>) -> Self {
        Self { client, logger }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, LspError> {
        let failed = |reason: String| LspError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    async fn fetch_and_extract(
        &self,
        url: &str,
        destination: &Path,
        archive_type: ArchiveType,
    ) -> Result<(), LspError> {
        self.logger.info(&format!("Downloading {}", url));
        let bytes = self.download(url).await?;
        self.logger.info(&format!(
            "Downloaded {} bytes, extracting {} archive to {}",
            bytes.len(),
            archive_type,
            destination.display()
        ));

        tokio::fs::create_dir_all(destination).await?;

        let destination = destination.to_path_buf();
        let file_name = file_name_from_url(url);
        tokio::task::spawn_blocking(move || {
            extract(&bytes, &destination, archive_type, &file_name)
        })
        .await
        .map_err(|e| LspError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

/// Last path segment of a URL, used to name non-archive downloads
fn file_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').find(|s| !s.is_empty()))
        .unwrap_or("download")
        .to_string()
}

/// Unpack `bytes` into `destination`
pub fn extract(
    bytes: &[u8],
    destination: &Path,
    archive_type: ArchiveType,
    file_name: &str,
) -> Result<(), LspError> {
    match archive_type {
        ArchiveType::Zip => {
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(invalid_archive)?;
            archive.extract(destination).map_err(invalid_archive)?;
        }
        ArchiveType::Tar => {
            tar::Archive::new(Cursor::new(bytes)).unpack(destination)?;
        }
        ArchiveType::Gztar => {
            tar::Archive::new(GzDecoder::new(Cursor::new(bytes))).unpack(destination)?;
        }
        ArchiveType::Gz => {
            let mut content = Vec::new();
            GzDecoder::new(Cursor::new(bytes)).read_to_end(&mut content)?;
            let name = file_name.strip_suffix(".gz").unwrap_or(file_name);
            write_executable(&destination.join(name), &content)?;
        }
        ArchiveType::Binary => {
            write_executable(&destination.join(file_name), bytes)?;
        }
    }
    Ok(())
}

fn invalid_archive(e: zip::result::ZipError) -> LspError {
    LspError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn write_executable(path: &Path, content: &[u8]) -> Result<(), LspError> {
    std::fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}
