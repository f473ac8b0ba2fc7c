// src/hooks.rs

use std::path::Path;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use reqwest::{RequestBuilder, Response};
use url::Url;

use crate::fetcher::FileExistsPolicy;
use crate::models::DownloadItem;

/// Customizes a request right before it is sent.
pub type RequestHook = dyn Fn(RequestBuilder) -> RequestBuilder + Send + Sync;

/// Observes the response once its headers arrive.
pub type ResponseHook = dyn Fn(&Response) + Send + Sync;

/// Observes a redirect as `(requested, resolved)` when the two differ.
pub type RedirectHook = dyn Fn(&Url, &Url) + Send + Sync;

/// Decides what to do with an existing destination file. Receives the path
/// and the scheduler's default policy and returns the policy to apply.
pub type ConflictHook = dyn Fn(&Path, FileExistsPolicy) -> FileExistsPolicy + Send + Sync;

/// Observes progress as `(item, received_bytes, total_bytes)`.
pub type ProgressHook = dyn Fn(&DownloadItem, u64, u64) + Send + Sync;

/// Inspects a finished download before it is marked complete; returning
/// `true` flags the file as corrupted and sends the item back to the queue.
pub type VerifyHook = dyn Fn(Arc<DownloadItem>) -> BoxFuture<'static, bool> + Send + Sync;

/// Optional callbacks threaded through every fetch a scheduler launches.
///
/// State-change notifications are not configured here; they live on each
/// [`DownloadItem`](crate::models::DownloadItem) itself.
#[derive(Default)]
pub struct Hooks {
    request: Option<Box<RequestHook>>,
    response: Option<Box<ResponseHook>>,
    redirect: Option<Box<RedirectHook>>,
    conflict: Option<Box<ConflictHook>>,
    progress: Option<Box<ProgressHook>>,
    verify: Option<Box<VerifyHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(
        mut self,
        hook: impl Fn(RequestBuilder) -> RequestBuilder + Send + Sync + 'static,
    ) -> Self {
        self.request = Some(Box::new(hook));
        self
    }

    pub fn on_response(mut self, hook: impl Fn(&Response) + Send + Sync + 'static) -> Self {
        self.response = Some(Box::new(hook));
        self
    }

    pub fn on_redirect(mut self, hook: impl Fn(&Url, &Url) + Send + Sync + 'static) -> Self {
        self.redirect = Some(Box::new(hook));
        self
    }

    pub fn on_conflict(
        mut self,
        hook: impl Fn(&Path, FileExistsPolicy) -> FileExistsPolicy + Send + Sync + 'static,
    ) -> Self {
        self.conflict = Some(Box::new(hook));
        self
    }

    pub fn on_progress(
        mut self,
        hook: impl Fn(&DownloadItem, u64, u64) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(hook));
        self
    }

    /// Installs the post-download corruption check, e.g.
    /// [`integrity::sha256_verifier`](crate::integrity::sha256_verifier).
    pub fn verify_with(mut self, hook: Box<VerifyHook>) -> Self {
        self.verify = Some(hook);
        self
    }

    pub(crate) fn customize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.request {
            Some(hook) => hook(builder),
            None => builder,
        }
    }

    pub(crate) fn response_received(&self, response: &Response) {
        if let Some(hook) = &self.response {
            hook(response);
        }
    }

    pub(crate) fn redirected(&self, requested: &Url, resolved: &Url) {
        if let Some(hook) = &self.redirect {
            hook(requested, resolved);
        }
    }

    pub(crate) fn resolve_conflict(&self, path: &Path, default: FileExistsPolicy) -> FileExistsPolicy {
        match &self.conflict {
            Some(hook) => hook(path, default),
            None => default,
        }
    }

    pub(crate) fn progress_changed(&self, item: &DownloadItem, received: u64, total: u64) {
        if let Some(hook) = &self.progress {
            hook(item, received, total);
        }
    }

    pub(crate) async fn is_corrupted(&self, item: Arc<DownloadItem>) -> bool {
        match &self.verify {
            Some(hook) => hook(item).await,
            None => false,
        }
    }
}
