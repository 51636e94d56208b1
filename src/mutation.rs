//! Optimistic mutations.
//!
//! A mutation is begun synchronously: in-flight fetches for the affected
//! keys are cancelled, a rollback snapshot is taken and the optimistic value
//! is written, all before the network call is polled. Settling it either
//! folds the update into the confirmed value and marks the keys stale, or
//! drops the update, restores the keys and raises one error notice.

use tracing::{info, warn};

use crate::cache::{MutationId, QueryCache, Updater};
use crate::client::Error;
use crate::query::{QueryData, QueryKey, QueryScope};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A user-visible message, e.g. a toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn error(message: &str) -> Self {
        Notice {
            level: NoticeLevel::Error,
            message: message.to_string(),
        }
    }
}

/// Where user-visible notices go.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Sends notices to the log. The default when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => info!(text = %notice.message, "notice"),
            NoticeLevel::Error => warn!(text = %notice.message, "notice"),
        }
    }
}

/// Keeps every notice it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .map(|notices| notices.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}

type Reconciler<R> = Arc<dyn Fn(Option<&QueryData>, &R) -> Option<QueryData> + Send + Sync>;

/// Describes one optimistic write: which entries it touches, how it changes
/// them, and how server truth is merged back on success.
pub struct Mutation<R> {
    label: &'static str,
    affected: Vec<QueryScope>,
    apply: Updater,
    reconcile: Option<Reconciler<R>>,
    invalidate: Vec<QueryScope>,
    error_message: String,
}

impl<R> Mutation<R> {
    pub fn new<F>(label: &'static str, apply: F) -> Self
    where
        F: Fn(Option<&QueryData>) -> Option<QueryData> + Send + Sync + 'static,
    {
        Mutation {
            label,
            affected: Vec::new(),
            apply: Arc::new(apply),
            reconcile: None,
            invalidate: Vec::new(),
            error_message: format!("Failed to {}", label),
        }
    }

    pub fn affecting<S: Into<QueryScope>>(mut self, scope: S) -> Self {
        self.affected.push(scope.into());
        self
    }

    /// On success, replace each affected value with `f(current, result)`.
    pub fn reconcile_with<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&QueryData>, &R) -> Option<QueryData> + Send + Sync + 'static,
    {
        self.reconcile = Some(Arc::new(f));
        self
    }

    /// Extra scopes to mark stale when the mutation succeeds.
    pub fn invalidating<S: Into<QueryScope>>(mut self, scope: S) -> Self {
        self.invalidate.push(scope.into());
        self
    }

    pub fn error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }
}

impl<R> fmt::Debug for Mutation<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("label", &self.label)
            .field("affected", &self.affected)
            .field("invalidate", &self.invalidate)
            .finish()
    }
}

#[derive(Clone)]
pub struct MutationExecutor {
    cache: QueryCache,
    notifier: Arc<dyn Notifier>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for MutationExecutor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MutationExecutor({:?})", self.cache)
    }
}

impl MutationExecutor {
    pub fn new(cache: QueryCache, notifier: Arc<dyn Notifier>) -> Self {
        MutationExecutor {
            cache,
            notifier,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Cancel fetches, snapshot and write the optimistic value for every
    /// affected key. Nothing here awaits.
    pub fn begin<R>(&self, mutation: Mutation<R>) -> PendingMutation<R> {
        let id = MutationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let keys = self.cache.resolve(&mutation.affected);
        for key in &keys {
            self.cache.push_update(key, id, mutation.apply.clone());
        }
        info!(label = mutation.label, %id, keys = keys.len(), "mutation started");

        PendingMutation {
            executor: self.clone(),
            id,
            label: mutation.label,
            keys,
            reconcile: mutation.reconcile,
            invalidate: mutation.invalidate,
            error_message: mutation.error_message,
            settled: false,
        }
    }

    /// Begin `mutation` and settle it with `invoke`.
    pub async fn execute<R, F>(&self, mutation: Mutation<R>, invoke: F) -> Result<R, Error>
    where
        R: Clone + Send + Sync + 'static,
        F: Future<Output = Result<R, Error>>,
    {
        self.begin(mutation).settle(invoke).await
    }
}

/// A begun mutation. Dropping it unsettled rolls it back silently.
#[must_use = "a pending mutation is rolled back when dropped"]
pub struct PendingMutation<R> {
    executor: MutationExecutor,
    id: MutationId,
    label: &'static str,
    keys: Vec<QueryKey>,
    reconcile: Option<Reconciler<R>>,
    invalidate: Vec<QueryScope>,
    error_message: String,
    settled: bool,
}

impl<R> PendingMutation<R> {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn keys(&self) -> &[QueryKey] {
        &self.keys
    }

    fn roll_back(&mut self) {
        for key in &self.keys {
            self.executor.cache.discard_update(key, self.id);
        }
        self.settled = true;
    }
}

impl<R> PendingMutation<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Await the network call and settle the optimistic state.
    pub async fn settle<F>(mut self, invoke: F) -> Result<R, Error>
    where
        F: Future<Output = Result<R, Error>>,
    {
        match invoke.await {
            Ok(result) => {
                self.confirm(&result);
                Ok(result)
            }
            Err(err) => {
                warn!(label = self.label, id = %self.id, error = %err, "mutation failed, rolling back");
                self.roll_back();
                self.executor
                    .notifier
                    .notify(Notice::error(&self.error_message));
                Err(err)
            }
        }
    }

    fn confirm(&mut self, result: &R) {
        let cache = &self.executor.cache;
        for key in &self.keys {
            let reconcile = self.reconcile.clone().map(|reconcile| {
                let result = result.clone();
                let updater: Updater =
                    Arc::new(move |current: Option<&QueryData>| reconcile(current, &result));
                updater
            });
            cache.confirm_update(key, self.id, reconcile);
        }
        for scope in &self.invalidate {
            cache.invalidate(scope);
        }
        self.settled = true;
        info!(label = self.label, id = %self.id, "mutation confirmed");
    }
}

impl<R> Drop for PendingMutation<R> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(label = self.label, id = %self.id, "pending mutation dropped, rolling back");
            self.roll_back();
        }
    }
}
