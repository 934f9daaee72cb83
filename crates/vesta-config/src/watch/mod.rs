//! Long-poll watch center
//!
//! Holds client registrations awaiting a newer version of one or more files.
//! Two indexes, like the subscriber manager of a push connection:
//! - file key -> client id -> (registration id, last known version)
//! - client id -> registration
//!
//! A registration completes once: matched by a visible change, expired at its
//! deadline, or cancelled when its `PendingWatch` is dropped or replaced.

mod registration;

pub use registration::WatchState;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vesta_common::VestaError;
use vesta_persistence::{ConfigFileKey, ReleaseType};

use crate::cache::{CacheManager, ReleaseChangeEvent};
use crate::model::{ChangedFile, FileWatcher, WatchConfigFileRequest, WatchedFile};
use registration::Registration;

/// Default long-poll timeout in milliseconds
pub const DEFAULT_WATCH_TIMEOUT_MS: u64 = 30_000;

/// Server-side ceiling of a client supplied timeout in milliseconds
pub const MAX_WATCH_TIMEOUT_MS: u64 = 120_000;

#[derive(Clone, Debug)]
pub struct WatchCenterConfig {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for WatchCenterConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_WATCH_TIMEOUT_MS),
            max_timeout: Duration::from_millis(MAX_WATCH_TIMEOUT_MS),
        }
    }
}

impl WatchCenterConfig {
    pub fn timeout_for(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.max_timeout),
            _ => self.default_timeout.min(self.max_timeout),
        }
    }
}

struct WatchInner {
    config: WatchCenterConfig,
    cache: Arc<CacheManager>,
    file_watchers: DashMap<String, HashMap<String, (u64, u64)>>,
    clients: DashMap<String, Arc<Registration>>,
    seq: AtomicU64,
}

/// Outcome of a registration attempt
pub enum WatchTicket {
    /// Something already differs from the client's snapshot
    Ready(Vec<ChangedFile>),
    Pending(PendingWatch),
}

/// A parked long-poll. Dropping it cancels the registration.
pub struct PendingWatch {
    inner: Arc<WatchInner>,
    registration: Arc<Registration>,
    receiver: oneshot::Receiver<Vec<ChangedFile>>,
}

impl PendingWatch {
    pub fn client_id(&self) -> &str {
        &self.registration.client_id
    }

    pub fn state(&self) -> WatchState {
        self.registration.state()
    }

    /// Wait for a visible change or the deadline; empty means no change
    pub async fn wait(mut self) -> Vec<ChangedFile> {
        let deadline = self.registration.deadline;
        tokio::select! {
            result = &mut self.receiver => result.unwrap_or_default(),
            _ = tokio::time::sleep_until(deadline) => {
                if self.inner.finish(&self.registration, WatchState::Expired, Vec::new()) {
                    debug!(client_id = %self.registration.client_id, "watch expired");
                }
                // a match may have won the race with the timer
                self.receiver.try_recv().unwrap_or_default()
            }
        }
    }
}

impl Drop for PendingWatch {
    fn drop(&mut self) {
        if self
            .inner
            .finish(&self.registration, WatchState::Cancelled, Vec::new())
        {
            debug!(client_id = %self.registration.client_id, "watch cancelled");
        }
    }
}

#[derive(Clone)]
pub struct WatchCenter {
    inner: Arc<WatchInner>,
}

impl WatchCenter {
    pub fn new(config: WatchCenterConfig, cache: Arc<CacheManager>) -> Self {
        Self {
            inner: Arc::new(WatchInner {
                config,
                cache,
                file_watchers: DashMap::new(),
                clients: DashMap::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Register a long-poll, or answer right away if a watched file already changed
    pub fn register(&self, req: &WatchConfigFileRequest) -> Result<WatchTicket, VestaError> {
        if req.client_id.is_empty() {
            return Err(VestaError::InvalidParameter(
                "client id is required".to_string(),
            ));
        }
        if req.watch_files.is_empty() {
            return Err(VestaError::InvalidParameter(
                "watch file list is empty".to_string(),
            ));
        }

        let inner = &self.inner;
        let labels = req.effective_labels();
        let files: HashMap<String, (ConfigFileKey, u64)> = req
            .watch_files
            .iter()
            .map(|w| {
                let file = w.file();
                (file.file_key(), (file, w.version))
            })
            .collect();

        let changed = inner.collect_changes(&files, &labels);
        if !changed.is_empty() {
            debug!(client_id = %req.client_id, count = changed.len(), "watch answered immediately");
            return Ok(WatchTicket::Ready(changed));
        }

        let id = inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = Instant::now() + inner.config.timeout_for(req.timeout_ms);
        let (registration, receiver) =
            Registration::new(id, req.client_id.clone(), labels, files, deadline);
        let registration = Arc::new(registration);

        if let Some(previous) = inner
            .clients
            .insert(req.client_id.clone(), registration.clone())
        {
            debug!(client_id = %req.client_id, "pending watch replaced");
            inner.finish(&previous, WatchState::Cancelled, Vec::new());
        }
        for (file_key, (_, version)) in &registration.files {
            inner
                .file_watchers
                .entry(file_key.clone())
                .or_default()
                .insert(req.client_id.clone(), (id, *version));
        }

        // a change may have landed between the first check and indexing
        let changed = inner.collect_changes(&registration.files, &registration.labels);
        if !changed.is_empty() {
            inner.finish(&registration, WatchState::Matched, changed);
        }

        Ok(WatchTicket::Pending(PendingWatch {
            inner: self.inner.clone(),
            registration,
            receiver,
        }))
    }

    /// Register and wait; dropping the returned future cancels the registration
    pub async fn long_pull(
        &self,
        req: &WatchConfigFileRequest,
    ) -> Result<Vec<ChangedFile>, VestaError> {
        match self.register(req)? {
            WatchTicket::Ready(changed) => Ok(changed),
            WatchTicket::Pending(pending) => Ok(pending.wait().await),
        }
    }

    /// Re-evaluate the watchers of one file
    pub fn notify_file(&self, file: &ConfigFileKey) {
        let client_ids: Vec<String> = self
            .inner
            .file_watchers
            .get(&file.file_key())
            .map(|w| w.keys().cloned().collect())
            .unwrap_or_default();
        for client_id in client_ids {
            self.inner.recheck_client(&client_id);
        }
    }

    /// Re-evaluate every pending registration
    pub fn notify_all(&self) {
        let client_ids: Vec<String> = self
            .inner
            .clients
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for client_id in client_ids {
            self.inner.recheck_client(&client_id);
        }
    }

    /// Consume cache change events until `shutdown` fires
    pub fn start(
        &self,
        mut events: broadcast::Receiver<ReleaseChangeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let center = self.clone();
        tokio::spawn(async move {
            info!("watch center started");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => center.notify_file(&event.file),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "watch center lagged behind release changes");
                            center.notify_all();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("watch center stopped");
        })
    }

    /// Watchers of a file with the version each last observed
    pub fn get_config_subscribers(&self, file: &ConfigFileKey) -> Vec<FileWatcher> {
        let mut watchers: Vec<FileWatcher> = self
            .inner
            .file_watchers
            .get(&file.file_key())
            .map(|w| {
                w.iter()
                    .map(|(client_id, (_, version))| FileWatcher {
                        client_id: client_id.clone(),
                        version: *version,
                    })
                    .collect()
            })
            .unwrap_or_default();
        watchers.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        watchers
    }

    /// Files a client is currently waiting on
    pub fn get_client_subscribers(&self, client_id: &str) -> Vec<WatchedFile> {
        let Some(registration) = self.inner.clients.get(client_id).map(|r| r.value().clone())
        else {
            return Vec::new();
        };
        let mut files: Vec<WatchedFile> = registration
            .files
            .values()
            .map(|(file, version)| WatchedFile {
                namespace: file.namespace.clone(),
                group: file.group.clone(),
                file_name: file.name.clone(),
                version: *version,
            })
            .collect();
        files.sort_by(|a, b| {
            (&a.namespace, &a.group, &a.file_name).cmp(&(&b.namespace, &b.group, &b.file_name))
        });
        files
    }

    /// Number of pending registrations
    pub fn watcher_count(&self) -> usize {
        self.inner.clients.len()
    }
}

impl WatchInner {
    /// Files whose visible version differs from the client's snapshot.
    /// A file with nothing visible counts as version 0.
    fn collect_changes(
        &self,
        files: &HashMap<String, (ConfigFileKey, u64)>,
        labels: &HashMap<String, String>,
    ) -> Vec<ChangedFile> {
        let mut changed: Vec<ChangedFile> = files
            .values()
            .filter_map(|(file, known_version)| {
                let visible = self.cache.resolve_meta(file, labels);
                let version = visible.as_ref().map_or(0, |m| m.version);
                if version == *known_version {
                    return None;
                }
                Some(match visible {
                    Some(meta) => ChangedFile {
                        namespace: meta.namespace,
                        group: meta.group,
                        file_name: meta.file_name,
                        release_type: meta.release_type,
                        version: meta.version,
                        md5: meta.md5,
                    },
                    None => ChangedFile {
                        namespace: file.namespace.clone(),
                        group: file.group.clone(),
                        file_name: file.name.clone(),
                        release_type: ReleaseType::Normal,
                        version: 0,
                        md5: String::new(),
                    },
                })
            })
            .collect();
        changed.sort_by(|a, b| {
            (&a.namespace, &a.group, &a.file_name).cmp(&(&b.namespace, &b.group, &b.file_name))
        });
        changed
    }

    fn recheck_client(&self, client_id: &str) {
        let Some(registration) = self.clients.get(client_id).map(|r| r.value().clone()) else {
            return;
        };
        let changed = self.collect_changes(&registration.files, &registration.labels);
        if changed.is_empty() {
            return;
        }
        let count = changed.len();
        if self.finish(&registration, WatchState::Matched, changed) {
            debug!(client_id = %client_id, count, "watch matched");
        }
    }

    /// Complete a registration and drop it from both indexes
    fn finish(
        &self,
        registration: &Registration,
        state: WatchState,
        changed: Vec<ChangedFile>,
    ) -> bool {
        let completed = registration.complete(state, changed);
        self.unindex(registration);
        completed
    }

    fn unindex(&self, registration: &Registration) {
        for file_key in registration.files.keys() {
            if let Some(mut watchers) = self.file_watchers.get_mut(file_key) {
                let owned = watchers
                    .get(&registration.client_id)
                    .is_some_and(|(id, _)| *id == registration.id);
                if owned {
                    watchers.remove(&registration.client_id);
                }
                if watchers.is_empty() {
                    drop(watchers);
                    self.file_watchers.remove_if(file_key, |_, w| w.is_empty());
                }
            }
        }
        self.clients
            .remove_if(&registration.client_id, |_, r| r.id == registration.id);
    }
}
