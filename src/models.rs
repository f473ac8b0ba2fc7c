// src/models.rs

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("{0:?} is not a valid initial state for a download item")]
    InvalidInitialState(ItemState),
    #[error("cannot move item from {from:?} to {to:?}")]
    InvalidTransition { from: ItemState, to: ItemState },
}

/// The lifecycle state of a download item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    Queued,
    Downloading,
    Stopped,
    Completed,
    Error,
}

/// Callback invoked on every state transition with `(item, old, new)`.
///
/// Delivery is synchronous and happens after the item's internal lock has
/// been released, so a listener may call [`DownloadItem::start`] or
/// [`DownloadItem::stop`] on the same item without deadlocking.
pub type StateListener = dyn Fn(&DownloadItem, ItemState, ItemState) + Send + Sync;

/// Handle returned by [`DownloadItem::on_state_changed`], used to detach the
/// listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ItemInner {
    state: ItemState,
    file_name: Option<String>,
    total_bytes: u64,
    received_bytes: u64,
    failure: Option<String>,
    restarts: u32,
}

/// One requested download: source URL, destination, credentials and live
/// progress, driven through a five-state lifecycle.
///
/// Items are created in `Queued` (or `Stopped`) state, handed to a scheduler
/// wrapped in an [`Arc`], and mutated only by the owning scheduler and the
/// caller-facing [`start`](Self::start)/[`stop`](Self::stop) methods.
pub struct DownloadItem {
    url: Url,
    directory: PathBuf,
    referer: Option<String>,
    username: Option<String>,
    password: Option<String>,
    inner: Mutex<ItemInner>,
    listeners: Mutex<HashMap<u64, Arc<StateListener>>>,
    next_listener: AtomicU64,
}

/// Serializable snapshot of a [`DownloadItem`], for callers that persist
/// their queue between runs. The crate itself writes nothing but the
/// downloaded files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub url: Url,
    pub directory: PathBuf,
    pub file_name: Option<String>,
    pub referer: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub state: ItemState,
    pub total_bytes: u64,
    pub received_bytes: u64,
    pub failure: Option<String>,
}

impl DownloadItem {
    /// Creates a queued item downloading `url` into `directory`.
    ///
    /// The URL must be absolute. The target file name is resolved during the
    /// fetch (from `Content-Disposition` or the URL path) unless fixed with
    /// [`with_file_name`](Self::with_file_name).
    pub fn new(url: &str, directory: impl Into<PathBuf>) -> Result<Self, ItemError> {
        Ok(Self {
            url: Url::parse(url)?,
            directory: directory.into(),
            referer: None,
            username: None,
            password: None,
            inner: Mutex::new(ItemInner {
                state: ItemState::Queued,
                file_name: None,
                total_bytes: 0,
                received_bytes: 0,
                failure: None,
                restarts: 0,
            }),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(0),
        })
    }

    /// Fixes the target file name instead of resolving it from the response.
    pub fn with_file_name(self, name: impl Into<String>) -> Self {
        self.lock().file_name = Some(name.into());
        self
    }

    /// Sets the referer sent with every request for this item.
    pub fn with_referer(self, referer: impl Into<String>) -> Self {
        Self {
            referer: Some(referer.into()),
            ..self
        }
    }

    /// Attaches basic-auth credentials sent as an `Authorization` header.
    pub fn with_basic_auth(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..self
        }
    }

    /// Overrides the initial state. Only `Queued` and `Stopped` are accepted.
    pub fn with_initial_state(self, state: ItemState) -> Result<Self, ItemError> {
        if !matches!(state, ItemState::Queued | ItemState::Stopped) {
            return Err(ItemError::InvalidInitialState(state));
        }
        self.lock().state = state;
        Ok(self)
    }

    /// Restores an item from a snapshot. A snapshot taken mid-transfer
    /// (`Downloading`) lands in `Stopped`, ready to be resumed.
    pub fn from_snapshot(snapshot: ItemSnapshot) -> Self {
        let state = match snapshot.state {
            ItemState::Downloading => ItemState::Stopped,
            other => other,
        };
        Self {
            url: snapshot.url,
            directory: snapshot.directory,
            referer: snapshot.referer,
            username: snapshot.username,
            password: snapshot.password,
            inner: Mutex::new(ItemInner {
                state,
                file_name: snapshot.file_name,
                total_bytes: snapshot.total_bytes,
                received_bytes: snapshot.received_bytes,
                failure: snapshot.failure,
                restarts: 0,
            }),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        let inner = self.lock();
        ItemSnapshot {
            url: self.url.clone(),
            directory: self.directory.clone(),
            file_name: inner.file_name.clone(),
            referer: self.referer.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            state: inner.state,
            total_bytes: inner.total_bytes,
            received_bytes: inner.received_bytes,
            failure: inner.failure.clone(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// The resolved target file name, if known yet.
    pub fn file_name(&self) -> Option<String> {
        self.lock().file_name.clone()
    }

    /// Full destination path, available once the file name is resolved.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.lock().file_name.as_ref().map(|name| self.directory.join(name))
    }

    pub fn state(&self) -> ItemState {
        self.lock().state
    }

    /// Failure reason recorded when the item entered `Error`.
    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    /// Total size in bytes; 0 until the server reports a length (or the
    /// transfer completes and the on-disk size is used).
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn received_bytes(&self) -> u64 {
        self.lock().received_bytes
    }

    /// Whole-number progress percentage; 0 while the total is unknown.
    pub fn percentage(&self) -> u8 {
        let inner = self.lock();
        if inner.total_bytes == 0 {
            0
        } else {
            (100 * inner.received_bytes / inner.total_bytes) as u8
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ItemState::Queued
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ItemState::Stopped
    }

    pub fn is_downloading(&self) -> bool {
        self.state() == ItemState::Downloading
    }

    /// Re-queues a stopped item. No-op in any other state: `Completed` and
    /// `Error` are terminal, and a queued or running item stays as it is.
    pub fn start(&self) {
        let _ = self.transition(ItemState::Queued, &[ItemState::Stopped], |_| {});
    }

    /// Stops a queued or running item; the scheduler cancels any in-flight
    /// transfer and partial bytes stay on disk. Idempotent.
    pub fn stop(&self) {
        let _ = self.transition(
            ItemState::Stopped,
            &[ItemState::Queued, ItemState::Downloading],
            |_| {},
        );
    }

    /// Registers a state-change listener and returns its detach handle.
    pub fn on_state_changed(
        &self,
        listener: impl Fn(&DownloadItem, ItemState, ItemState) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners_lock().insert(id, Arc::new(listener));
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners_lock().remove(&id.0);
    }

    pub(crate) fn begin_download(&self) -> Result<(), ItemError> {
        self.transition(ItemState::Downloading, &[ItemState::Queued], |_| {})
    }

    pub(crate) fn complete(&self, disk_len: u64) -> Result<(), ItemError> {
        self.transition(ItemState::Completed, &[ItemState::Downloading], |inner| {
            if inner.total_bytes == 0 {
                inner.total_bytes = disk_len;
            }
            inner.received_bytes = inner.total_bytes;
        })
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) -> Result<(), ItemError> {
        let reason = reason.into();
        self.transition(ItemState::Error, &[ItemState::Downloading], |inner| {
            inner.failure = Some(reason);
        })
    }

    /// Sends a running item back to the queue after a failed corruption
    /// check, counting the restart.
    pub(crate) fn requeue(&self) -> Result<(), ItemError> {
        self.transition(ItemState::Queued, &[ItemState::Downloading], |inner| {
            inner.restarts += 1;
        })
    }

    pub(crate) fn restarts(&self) -> u32 {
        self.lock().restarts
    }

    pub(crate) fn set_file_name(&self, name: impl Into<String>) {
        self.lock().file_name = Some(name.into());
    }

    pub(crate) fn set_progress(&self, received: u64, total: u64) {
        let mut inner = self.lock();
        inner.received_bytes = received;
        if total > 0 {
            inner.total_bytes = total;
        }
    }

    fn transition(
        &self,
        to: ItemState,
        permitted: &[ItemState],
        update: impl FnOnce(&mut ItemInner),
    ) -> Result<(), ItemError> {
        let old = {
            let mut inner = self.lock();
            if !permitted.contains(&inner.state) {
                return Err(ItemError::InvalidTransition { from: inner.state, to });
            }
            let old = inner.state;
            inner.state = to;
            update(&mut inner);
            old
        };
        self.notify(old, to);
        Ok(())
    }

    fn notify(&self, old: ItemState, new: ItemState) {
        // Listeners run without the item lock held and may re-enter
        // start()/stop() on this item.
        let listeners: Vec<Arc<StateListener>> = self.listeners_lock().values().cloned().collect();
        for listener in listeners {
            listener(self, old, new);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ItemInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners_lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<StateListener>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("DownloadItem")
            .field("url", &self.url.as_str())
            .field("file_name", &inner.file_name)
            .field("state", &inner.state)
            .field("received_bytes", &inner.received_bytes)
            .field("total_bytes", &inner.total_bytes)
            .finish()
    }
}
