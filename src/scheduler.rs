// src/scheduler.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::cookie::Jar;
use reqwest::{Client, Proxy};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::fetcher::{FetchOutcome, Fetcher, FileExistsPolicy};
use crate::hooks::Hooks;
use crate::limiter::SpeedLimiter;
use crate::models::{DownloadItem, ItemState, ListenerId};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("thread count must be greater than zero")]
    InvalidThreadCount,
    #[error("item is already managed by this scheduler: {0}")]
    DuplicateItem(Url),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// One in-flight transfer, keyed in the scheduler by its launch id.
struct Flight {
    item: Arc<DownloadItem>,
    cancel: CancellationToken,
}

struct Registered {
    item: Arc<DownloadItem>,
    listener: ListenerId,
}

struct SchedulerState {
    items: Vec<Registered>,
    in_flight: HashMap<u64, Flight>,
    thread_count: usize,
    next_flight: u64,
}

struct Core {
    state: Mutex<SchedulerState>,
    fetcher: Fetcher,
    hooks: Arc<Hooks>,
    limiter: SpeedLimiter,
    cookies: Arc<Jar>,
    max_corruption_restarts: u32,
}

/// Keeps at most `thread_count` transfers in flight, drawn from queued items
/// in insertion order. A finishing transfer immediately launches the next
/// queued item; there is no poll loop.
///
/// The scheduler reacts to item state changes: an item entering `Queued`
/// triggers a launch attempt, an item entering `Stopped` cancels its
/// in-flight transfer. Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct DownloadScheduler {
    core: Arc<Core>,
}

/// Configures and builds a [`DownloadScheduler`].
pub struct SchedulerBuilder {
    thread_count: usize,
    default_policy: FileExistsPolicy,
    max_corruption_restarts: u32,
    speed_limit: u64,
    user_agent: String,
    proxy: Option<Proxy>,
    hooks: Hooks,
}

impl SchedulerBuilder {
    fn new() -> Self {
        Self {
            thread_count: 1,
            default_policy: FileExistsPolicy::Overwrite,
            max_corruption_restarts: 3,
            speed_limit: 0,
            user_agent: concat!("downpool/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy: None,
            hooks: Hooks::new(),
        }
    }

    /// Number of transfers kept in flight at once. Defaults to 1.
    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    /// Policy applied when a destination file exists and no conflict hook
    /// overrides it. Defaults to [`FileExistsPolicy::Overwrite`].
    pub fn default_policy(mut self, policy: FileExistsPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// How often a download flagged as corrupted is re-queued before the
    /// item is parked in `Error`. Defaults to 3.
    pub fn max_corruption_restarts(mut self, restarts: u32) -> Self {
        self.max_corruption_restarts = restarts;
        self
    }

    /// Shared byte-rate limit across all transfers; 0 (default) is unlimited.
    pub fn speed_limit(mut self, bytes_per_sec: u64) -> Self {
        self.speed_limit = bytes_per_sec;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Routes every transfer through `proxy`.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Result<DownloadScheduler, SchedulerError> {
        if self.thread_count == 0 {
            return Err(SchedulerError::InvalidThreadCount);
        }
        let cookies = Arc::new(Jar::default());
        let mut client = Client::builder()
            .user_agent(&self.user_agent)
            .cookie_provider(cookies.clone());
        if let Some(proxy) = self.proxy {
            client = client.proxy(proxy);
        }
        let client = client.build()?;
        let hooks = Arc::new(self.hooks);
        let limiter = SpeedLimiter::new(self.speed_limit);
        let fetcher = Fetcher::new(client, hooks.clone(), self.default_policy, limiter.clone());

        Ok(DownloadScheduler {
            core: Arc::new(Core {
                state: Mutex::new(SchedulerState {
                    items: Vec::new(),
                    in_flight: HashMap::new(),
                    thread_count: self.thread_count,
                    next_flight: 0,
                }),
                fetcher,
                hooks,
                limiter,
                cookies,
                max_corruption_restarts: self.max_corruption_restarts,
            }),
        })
    }
}

impl DownloadScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Raises or lowers the concurrency bound; freed slots are filled
    /// immediately.
    pub fn set_thread_count(&self, count: usize) -> Result<(), SchedulerError> {
        if count == 0 {
            return Err(SchedulerError::InvalidThreadCount);
        }
        self.core.lock().thread_count = count;
        info!(thread_count = count, "concurrency bound updated");
        self.core.launch_pending();
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.core.lock().thread_count
    }

    /// Starts tracking `items` and launches into free slots if any of them
    /// are queued. An item already tracked by this scheduler is rejected.
    pub fn add_items(
        &self,
        items: impl IntoIterator<Item = Arc<DownloadItem>>,
    ) -> Result<(), SchedulerError> {
        let items: Vec<_> = items.into_iter().collect();
        let mut any_ready = false;
        {
            let mut state = self.core.lock();
            for (index, item) in items.iter().enumerate() {
                let duplicate = state.items.iter().any(|r| Arc::ptr_eq(&r.item, item))
                    || items[..index].iter().any(|prev| Arc::ptr_eq(prev, item));
                if duplicate {
                    return Err(SchedulerError::DuplicateItem(item.url().clone()));
                }
            }
            for item in items {
                let weak = Arc::downgrade(&self.core);
                let listener = item.on_state_changed(move |changed, _old, new| {
                    if let Some(core) = weak.upgrade() {
                        core.item_state_changed(changed, new);
                    }
                });
                any_ready |= item.is_ready();
                debug!(url = %item.url(), "item added");
                state.items.push(Registered { item, listener });
            }
        }
        if any_ready {
            self.core.launch_pending();
        }
        Ok(())
    }

    /// Stops and forgets the given items. Unknown items are ignored.
    pub fn remove_items(&self, items: &[Arc<DownloadItem>]) {
        for item in items {
            item.stop();
        }
        let mut state = self.core.lock();
        state.items.retain(|registered| {
            let removing = items.iter().any(|item| Arc::ptr_eq(item, &registered.item));
            if removing {
                registered.item.remove_listener(registered.listener);
                debug!(url = %registered.item.url(), "item removed");
            }
            !removing
        });
    }

    /// Stops every queued or running item; in-flight transfers are cancelled.
    pub fn stop_all_items(&self) {
        for item in self.items() {
            if item.is_ready() || item.is_downloading() {
                item.stop();
            }
        }
    }

    /// Re-queues every stopped item.
    pub fn resume_all_items(&self) {
        for item in self.items() {
            if item.is_stopped() {
                item.start();
            }
        }
    }

    /// Snapshot of all tracked items in insertion order.
    pub fn items(&self) -> Vec<Arc<DownloadItem>> {
        self.core.lock().items.iter().map(|r| r.item.clone()).collect()
    }

    /// True when no transfer is in flight.
    pub fn is_stopped(&self) -> bool {
        self.core.lock().in_flight.is_empty()
    }

    /// The cookie jar shared by every request this scheduler sends.
    pub fn cookies(&self) -> &Arc<Jar> {
        &self.core.cookies
    }

    /// The shared speed limiter; adjust it at runtime with
    /// [`SpeedLimiter::set_rate`].
    pub fn speed_limiter(&self) -> &SpeedLimiter {
        &self.core.limiter
    }
}

impl Core {
    fn item_state_changed(self: &Arc<Self>, item: &DownloadItem, new: ItemState) {
        match new {
            ItemState::Queued => self.launch_pending(),
            ItemState::Stopped => self.cancel_flight(item),
            _ => {}
        }
    }

    fn cancel_flight(&self, item: &DownloadItem) {
        let state = self.lock();
        for flight in state.in_flight.values() {
            if std::ptr::eq(Arc::as_ptr(&flight.item), item) {
                debug!(url = %flight.item.url(), "cancelling in-flight transfer");
                flight.cancel.cancel();
                break;
            }
        }
    }

    /// Fills free slots with queued items, first come first served. The slot
    /// is reserved under the lock, but the `Queued -> Downloading` transition
    /// runs after release so listeners may re-enter the scheduler.
    fn launch_pending(self: &Arc<Self>) {
        loop {
            let Some((id, item, cancel)) = self.reserve_slot() else {
                return;
            };
            if item.begin_download().is_err() {
                // The item left Queued between reservation and transition.
                self.lock().in_flight.remove(&id);
                continue;
            }
            debug!(url = %item.url(), flight = id, "transfer launched");
            let core = self.clone();
            tokio::spawn(async move { core.drive(id, item, cancel).await });
        }
    }

    fn reserve_slot(&self) -> Option<(u64, Arc<DownloadItem>, CancellationToken)> {
        let mut state = self.lock();
        if state.in_flight.len() >= state.thread_count {
            return None;
        }
        let item = {
            let in_flight = &state.in_flight;
            state
                .items
                .iter()
                .map(|registered| &registered.item)
                .find(|item| {
                    item.is_ready() && !in_flight.values().any(|f| Arc::ptr_eq(&f.item, *item))
                })?
                .clone()
        };
        let id = state.next_flight;
        state.next_flight += 1;
        let cancel = CancellationToken::new();
        state.in_flight.insert(
            id,
            Flight {
                item: item.clone(),
                cancel: cancel.clone(),
            },
        );
        Some((id, item, cancel))
    }

    async fn drive(self: Arc<Self>, id: u64, item: Arc<DownloadItem>, cancel: CancellationToken) {
        let result = self.fetcher.run(&item, &cancel).await;
        self.lock().in_flight.remove(&id);

        match result {
            Ok(FetchOutcome::Cancelled) => {
                self.refresh_partial(&item).await;
                debug!(url = %item.url(), received = item.received_bytes(), "transfer stopped");
            }
            Ok(outcome) => self.finish(&item, outcome).await,
            Err(error) => {
                warn!(url = %item.url(), %error, "download failed");
                // A stop() racing the failure wins; the rejected transition
                // is harmless.
                let _ = item.fail(error.to_string());
            }
        }

        self.launch_pending();
    }

    async fn finish(&self, item: &Arc<DownloadItem>, outcome: FetchOutcome) {
        if self.hooks.is_corrupted(item.clone()).await {
            if item.restarts() >= self.max_corruption_restarts {
                warn!(
                    url = %item.url(),
                    restarts = item.restarts(),
                    "corruption restart limit reached"
                );
                let _ = item.fail("downloaded file failed the corruption check");
            } else {
                info!(url = %item.url(), "corrupted download re-queued");
                let _ = item.requeue();
            }
            return;
        }

        let disk_len = match item.file_path() {
            Some(path) => tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
            None => 0,
        };
        if item.complete(disk_len).is_ok() {
            info!(url = %item.url(), bytes = disk_len, ?outcome, "download completed");
        }
    }

    /// After a cancellation the partial file on disk is the truth; bring the
    /// item's received count in line with it.
    async fn refresh_partial(&self, item: &Arc<DownloadItem>) {
        let Some(path) = item.file_path() else {
            return;
        };
        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            item.set_progress(metadata.len(), item.total_bytes());
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
