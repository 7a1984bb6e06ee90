//! Retrieval of archives, sidecars, and markers from a URL or a local path.

use std::path::{Path, PathBuf};
#[cfg(feature = "http-reqwest")]
use std::time::Duration;

use crate::error::{BiddleError, IoContext, Result};
use crate::utils::{self, is_remote};

#[cfg(feature = "http-reqwest")]
const REQUEST_TIMEOUT_SECS: u64 = 30;
#[cfg(feature = "http-reqwest")]
const MAX_REDIRECTS: usize = 10;

#[cfg(feature = "http-reqwest")]
fn timeout_from_env() -> Duration {
    let secs = std::env::var("BIDDLE_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(REQUEST_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Fetches over HTTP(S) for URLs and from disk for everything else.
/// Cloning shares the underlying connection pool.
#[derive(Clone)]
pub struct Fetcher {
    #[cfg(feature = "http-reqwest")]
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        #[cfg(feature = "http-reqwest")]
        {
            let client = reqwest::Client::builder()
                .timeout(timeout_from_env())
                .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
                .user_agent(concat!("biddle/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| BiddleError::network("client", "", e))?;
            Ok(Fetcher { client })
        }
        #[cfg(not(feature = "http-reqwest"))]
        {
            Ok(Fetcher {})
        }
    }

    pub async fn fetch_bytes(&self, location: &str) -> Result<Vec<u8>> {
        if is_remote(location) {
            self.fetch_remote(location).await
        } else {
            tokio::fs::read(location).await.io_context("read", location)
        }
    }

    pub async fn fetch_text(&self, location: &str) -> Result<String> {
        let bytes = self.fetch_bytes(location).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write the resource to `dest`, creating its parent. Returns bytes written.
    pub async fn fetch_to_file(&self, location: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .io_context("create_dir", parent)?;
        }
        if is_remote(location) {
            let bytes = self.fetch_remote(location).await?;
            tokio::fs::write(dest, &bytes).await.io_context("write", dest)?;
            Ok(bytes.len() as u64)
        } else {
            tokio::fs::copy(location, dest).await.io_context("copy", location)
        }
    }

    #[cfg(feature = "http-reqwest")]
    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BiddleError::network("fetch", url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BiddleError::network("fetch", url, format!("HTTP {}", status)));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| BiddleError::network("fetch", url, e))?;
        Ok(body.to_vec())
    }

    #[cfg(not(feature = "http-reqwest"))]
    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>> {
        Err(BiddleError::network(
            "fetch",
            url,
            "built without the http-reqwest feature",
        ))
    }
}

/// Save a URL or path into `dir` under its derived file name.
pub async fn get(fetcher: &Fetcher, location: &str, dir: &Path) -> Result<(PathBuf, u64)> {
    let dest = dir.join(utils::file_name_from_location(location));
    let size = fetcher.fetch_to_file(location, &dest).await?;
    utils::log(&format!("File {} written at {} bytes.", dest.display(), utils::commas(size)));
    Ok((dest, size))
}
