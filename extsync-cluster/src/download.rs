//! Fetching a published archive onto a receiving peer.
//!
//! [`Downloader`] is the injected seam; [`HttpDownloader`] is the `ureq`
//! implementation. [`download_to`] wraps either and refuses to trust a
//! downloader that reports success without producing the file.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use extsync_core::{SyncConfig, SyncError};

/// Streams a URL into a local file.
#[cfg_attr(test, mockall::automock)]
pub trait Downloader: Send + Sync {
    /// Download `url` into `dest`, replacing anything already there.
    fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download failed for {url}: {reason}")]
    HttpError { url: String, reason: String },

    #[error("archive not found: {url}")]
    NotFound { url: String },

    #[error("I/O error writing download: {0}")]
    Io(#[from] io::Error),
}

/// HTTP(S) downloader bounded by a whole-request timeout.
#[derive(Clone)]
pub struct HttpDownloader {
    agent: ureq::Agent,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }

    /// Downloader bounded by `download_timeout_secs`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.download_timeout())
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| map_ureq_error(url, e))?;
        let mut file = File::create(dest)?;
        io::copy(&mut response.into_reader(), &mut file)?;
        file.sync_all()?;
        Ok(())
    }
}

fn map_ureq_error(url: &str, err: ureq::Error) -> DownloadError {
    let url = redact(url).to_owned();
    match err {
        ureq::Error::Status(404, _) => DownloadError::NotFound { url },
        ureq::Error::Status(code, response) => DownloadError::HttpError {
            url,
            reason: format!("HTTP {code} {}", response.status_text()),
        },
        ureq::Error::Transport(transport) => DownloadError::HttpError {
            url,
            reason: transport.to_string(),
        },
    }
}

/// `url` without its query string, so signatures never reach logs.
pub(crate) fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// Download `url` to `dest` through `downloader`.
///
/// Any transport failure, and a reported success that left no file behind,
/// surfaces as an I/O failure.
pub fn download_to(downloader: &dyn Downloader, url: &str, dest: &Path) -> Result<(), SyncError> {
    if let Err(err) = downloader.download(url, dest) {
        tracing::warn!(url = redact(url), error = %err, "download failed");
        return Err(SyncError::IoFailure(format!(
            "failed to download {}: {err}",
            redact(url)
        )));
    }
    if !dest.is_file() {
        return Err(SyncError::IoFailure(format!(
            "download of {} reported success but {} does not exist",
            redact(url),
            dest.display()
        )));
    }
    tracing::debug!(url = redact(url), dest = %dest.display(), "downloaded archive");
    Ok(())
}
