use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::{RANGE, REFERER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::headers;
use crate::hooks::Hooks;
use crate::limiter::SpeedLimiter;
use crate::models::DownloadItem;

/// Errors for a single transfer. Cancellation is not among them; it is a
/// regular [`FetchOutcome`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server answered with status {0}")]
    Status(StatusCode),
    #[error("no file name could be resolved for {0}")]
    NoFileName(Url),
    #[error("cannot resume: server does not accept byte ranges")]
    RangeNotSupported,
}

/// How to treat a destination file that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExistsPolicy {
    /// Truncate the existing file and download from scratch.
    Overwrite,
    /// Append to the existing file, requesting the missing byte range.
    Resume,
    /// Treat the existing file as the finished download.
    Ignore,
    /// Keep the existing file and download under a probed free name.
    Rename,
}

/// Outcome of a transfer that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The body was streamed to disk completely.
    Completed,
    /// Nothing was transferred; the destination already holds the file.
    AlreadyComplete,
    /// The transfer was cancelled; partial bytes remain on disk.
    Cancelled,
}

/// What the HEAD probe learned about the resource.
struct Probe {
    final_url: Url,
    range_support: bool,
    remote_length: Option<u64>,
    file_name: Option<String>,
}

/// Performs one HTTP(S) transfer for a [`DownloadItem`]: probe, file-name
/// resolution, conflict handling, then a streaming GET with an optional
/// `Range` header.
pub struct Fetcher {
    client: Client,
    hooks: Arc<Hooks>,
    default_policy: FileExistsPolicy,
    limiter: SpeedLimiter,
}

impl Fetcher {
    pub fn new(
        client: Client,
        hooks: Arc<Hooks>,
        default_policy: FileExistsPolicy,
        limiter: SpeedLimiter,
    ) -> Self {
        Self {
            client,
            hooks,
            default_policy,
            limiter,
        }
    }

    /// Runs the transfer until it finishes or `cancel` fires. Cancellation
    /// aborts at the next suspension point (connect, header wait or body
    /// chunk) and leaves any partial bytes on disk.
    pub async fn run(
        &self,
        item: &Arc<DownloadItem>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(url = %item.url(), "transfer cancelled");
                Ok(FetchOutcome::Cancelled)
            }
            result = self.transfer(item) => result,
        }
    }

    async fn transfer(&self, item: &Arc<DownloadItem>) -> Result<FetchOutcome, FetchError> {
        tokio::fs::create_dir_all(item.directory()).await?;

        let probe = self.probe(item).await?;

        let name = match item.file_name() {
            Some(name) => name,
            None => probe
                .file_name
                .clone()
                .or_else(|| headers::file_name_from_url(&probe.final_url))
                .ok_or_else(|| FetchError::NoFileName(item.url().clone()))?,
        };
        item.set_file_name(name.as_str());

        let mut path = item.directory().join(&name);
        let mut resume_from = 0u64;

        if tokio::fs::try_exists(&path).await? {
            let policy = self.hooks.resolve_conflict(&path, self.default_policy);
            debug!(path = %path.display(), ?policy, "destination already exists");
            match policy {
                FileExistsPolicy::Ignore => {
                    // The bytes on disk are taken as-is, whatever the server
                    // would have sent.
                    let existing = tokio::fs::metadata(&path).await?.len();
                    item.set_progress(existing, existing);
                    return Ok(FetchOutcome::AlreadyComplete);
                }
                FileExistsPolicy::Resume => {
                    let existing = tokio::fs::metadata(&path).await?.len();
                    if let Some(total) = probe.remote_length {
                        if existing >= total {
                            item.set_progress(existing, total);
                            return Ok(FetchOutcome::AlreadyComplete);
                        }
                    }
                    if !probe.range_support {
                        return Err(FetchError::RangeNotSupported);
                    }
                    resume_from = existing;
                }
                FileExistsPolicy::Rename => {
                    path = free_path(&path).await?;
                    if let Some(renamed) = path.file_name().and_then(|n| n.to_str()) {
                        item.set_file_name(renamed);
                    }
                }
                FileExistsPolicy::Overwrite => {}
            }
        }

        let response = self.request_body(item, &probe, resume_from).await?;

        // For a 206 the Content-Length covers only the remaining range.
        let total = match headers::content_length(response.headers()) {
            Some(length) => resume_from + length,
            None => probe.remote_length.unwrap_or(0),
        };
        item.set_progress(resume_from, total);
        self.hooks.progress_changed(item, resume_from, total);

        let mut file = if resume_from > 0 {
            OpenOptions::new().append(true).open(&path).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?
        };

        let mut received = resume_from;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            self.limiter.acquire(bytes.len() as u64).await;
            file.write_all(&bytes).await?;
            received += bytes.len() as u64;
            item.set_progress(received, total);
            self.hooks.progress_changed(item, received, total);
        }
        file.flush().await?;

        debug!(url = %item.url(), bytes = received - resume_from, "transfer finished");
        Ok(FetchOutcome::Completed)
    }

    /// HEAD probe resolving the final URL, byte-range support, length and a
    /// server-suggested file name. A server rejecting HEAD degrades the
    /// probe instead of failing the fetch.
    async fn probe(&self, item: &Arc<DownloadItem>) -> Result<Probe, FetchError> {
        let response = self.prepare(Method::HEAD, item.url().clone(), item).send().await?;

        let final_url = response.url().clone();
        if final_url != *item.url() {
            debug!(from = %item.url(), to = %final_url, "request was redirected");
            self.hooks.redirected(item.url(), &final_url);
        }

        if !response.status().is_success() {
            warn!(
                status = %response.status(),
                url = %item.url(),
                "probe rejected; continuing without range support"
            );
            return Ok(Probe {
                final_url,
                range_support: false,
                remote_length: None,
                file_name: None,
            });
        }

        Ok(Probe {
            range_support: headers::accepts_byte_ranges(response.headers()),
            remote_length: headers::content_length(response.headers()),
            file_name: headers::content_disposition_file_name(response.headers()),
            final_url,
        })
    }

    async fn request_body(
        &self,
        item: &Arc<DownloadItem>,
        probe: &Probe,
        resume_from: u64,
    ) -> Result<Response, FetchError> {
        let mut builder = self.prepare(Method::GET, probe.final_url.clone(), item);
        if resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={resume_from}-"));
        }

        let response = builder.send().await?;
        self.hooks.response_received(&response);

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }
        // A server that advertised ranges but answers a range request with a
        // plain 200 would corrupt the appended file.
        if resume_from > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::RangeNotSupported);
        }
        Ok(response)
    }

    fn prepare(&self, method: Method, url: Url, item: &DownloadItem) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(referer) = item.referer() {
            builder = builder.header(REFERER, referer);
        }
        if let Some(username) = item.username() {
            builder = builder.basic_auth(username, item.password());
        }
        self.hooks.customize(builder)
    }
}

/// Probes `<stem> - New<ext>` repeatedly until a free path is found.
async fn free_path(path: &Path) -> Result<PathBuf, std::io::Error> {
    let mut candidate = renamed(path);
    while tokio::fs::try_exists(&candidate).await? {
        candidate = renamed(&candidate);
    }
    Ok(candidate)
}

fn renamed(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(extension) => format!("{stem} - New.{extension}"),
        None => format!("{stem} - New"),
    };
    path.with_file_name(name)
}
