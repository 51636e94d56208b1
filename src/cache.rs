//! Client-side query cache.
//!
//! Each entry keeps the last confirmed value (`base`) plus an issue-ordered
//! log of optimistic updates that have not settled yet. The value readers
//! see is `base` with the log replayed on top. Settling an update either
//! folds it into `base` or drops it from the log, so a slow failure can
//! never put back a value that later updates already built upon.
//!
//! Fetches are guarded by a per-entry generation. Cancelling, and starting
//! or settling an optimistic update, moves the entry to a new generation and
//! a late result from an older one is discarded when it arrives. Generations
//! come from one counter per cache, so an entry that was dropped and created
//! again never reuses a number an old ticket still holds.

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::client::Error;
use crate::query::{QueryData, QueryKey, QueryScope};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pure function from the current value of an entry to its next value.
pub type Updater = Arc<dyn Fn(Option<&QueryData>) -> Option<QueryData> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutationId(pub(crate) u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

struct PendingUpdate {
    id: MutationId,
    snapshot: Option<QueryData>,
    apply: Updater,
    confirmed: bool,
}

struct Entry {
    base: Option<QueryData>,
    visible: Option<QueryData>,
    pending: Vec<PendingUpdate>,
    stale: bool,
    generation: u64,
    /// Generation of the fetch still outstanding, if any.
    fetching: Option<u64>,
}

impl Entry {
    fn new(generation: u64) -> Self {
        Entry {
            base: None,
            visible: None,
            pending: Vec::new(),
            stale: false,
            generation,
            fetching: None,
        }
    }

    /// Move to `generation`. Outstanding fetches no longer count.
    fn restart(&mut self, generation: u64) {
        self.generation = generation;
        self.fetching = None;
    }

    fn is_fetching(&self) -> bool {
        self.fetching == Some(self.generation)
    }

    /// Holds nothing worth keeping.
    fn is_vacant(&self) -> bool {
        self.base.is_none()
            && self.visible.is_none()
            && self.pending.is_empty()
            && self.fetching.is_none()
    }

    fn recompute(&mut self) {
        let mut value = self.base.clone();
        for update in &self.pending {
            value = (update.apply)(value.as_ref());
        }
        self.visible = value;
    }

    fn fold_confirmed(&mut self) {
        while self.pending.first().map_or(false, |u| u.confirmed) {
            let update = self.pending.remove(0);
            self.base = (update.apply)(self.base.as_ref());
        }
    }
}

/// Proof that a fetch was started at a given generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    key: QueryKey,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

#[derive(Clone, Default)]
pub struct QueryCache {
    entries: Arc<DashMap<QueryKey, Entry>>,
    generations: Arc<AtomicU64>,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "QueryCache({} entries)", self.entries.len())
    }
}

impl QueryCache {
    pub fn new() -> Self {
        QueryCache::default()
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn entry(&self, key: &QueryKey) -> RefMut<'_, QueryKey, Entry> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(self.next_generation()))
    }

    /// Drop `key` when its entry holds nothing. Callers must not hold a guard
    /// into the map.
    fn prune(&self, key: &QueryKey) {
        if self.entries.remove_if(key, |_, entry| entry.is_vacant()).is_some() {
            trace!(?key, "dropped empty entry");
        }
    }

    /// Number of entries, including ones only tracking a fetch or an
    /// optimistic update.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &QueryKey) -> Option<QueryData> {
        self.entries.get(key).and_then(|entry| entry.visible.clone())
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries
            .get(key)
            .map_or(false, |entry| entry.visible.is_some())
    }

    /// Missing entries count as stale.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries
            .get(key)
            .map_or(true, |entry| entry.stale || entry.visible.is_none())
    }

    /// Authoritative write. Pending optimistic updates are replayed on top.
    pub fn set(&self, key: QueryKey, data: QueryData) {
        let mut entry = self.entry(&key);
        entry.base = Some(data);
        entry.stale = false;
        entry.recompute();
    }

    /// Keys with a value that `scope` selects.
    pub fn keys_matching(&self, scope: &QueryScope) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|entry| entry.visible.is_some() && scope.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Concrete keys for a set of scopes. An exact key always resolves to
    /// itself, cached or not.
    pub fn resolve(&self, scopes: &[QueryScope]) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = Vec::new();
        for scope in scopes {
            let found = match scope {
                QueryScope::Key(key) => vec![key.clone()],
                broad => self.keys_matching(broad),
            };
            for key in found {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Cached keys whose value is out of date.
    pub fn stale_keys(&self) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|entry| entry.stale && entry.visible.is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Mark every entry `scope` selects as stale. Returns how many were hit.
    pub fn invalidate(&self, scope: &QueryScope) -> usize {
        let mut hit = 0;
        for mut entry in self.entries.iter_mut() {
            if scope.matches(entry.key()) {
                entry.stale = true;
                hit += 1;
            }
        }
        debug!(?scope, hit, "invalidated queries");
        hit
    }

    /// Cancel any in-flight fetch for `key`. Its result will be discarded.
    pub fn cancel(&self, key: &QueryKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.restart(self.next_generation());
        }
        self.prune(key);
    }

    /// Whether a fetch started at the current generation of `key` is still
    /// outstanding.
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.entries.get(key).map_or(false, |entry| entry.is_fetching())
    }

    pub fn begin_fetch(&self, key: &QueryKey) -> FetchTicket {
        let mut entry = self.entry(key);
        let generation = entry.generation;
        entry.fetching = Some(generation);
        FetchTicket {
            key: key.clone(),
            generation,
        }
    }

    /// Start a fetch unless one for the current generation is already
    /// outstanding.
    pub fn try_begin_fetch(&self, key: &QueryKey) -> Option<FetchTicket> {
        let mut entry = self.entry(key);
        if entry.is_fetching() {
            return None;
        }
        let generation = entry.generation;
        entry.fetching = Some(generation);
        Some(FetchTicket {
            key: key.clone(),
            generation,
        })
    }

    /// Give up on a fetch that produced no value.
    pub fn abandon_fetch(&self, ticket: FetchTicket) {
        if let Some(mut entry) = self.entries.get_mut(&ticket.key) {
            if entry.fetching == Some(ticket.generation) {
                entry.fetching = None;
            }
        }
        self.prune(&ticket.key);
    }

    /// Store a fetched value. Returns false when the fetch was cancelled, an
    /// optimistic update started or settled on the key since the fetch
    /// began, or one is still pending. The entry then keeps its value and
    /// stale flag so the next read refetches.
    pub fn complete_fetch(&self, ticket: FetchTicket, data: QueryData) -> bool {
        self.complete_fetch_with(ticket, move |_| data)
    }

    /// Like [`complete_fetch`](Self::complete_fetch), but builds the new
    /// value from the confirmed one. Used to append further pages.
    pub fn complete_fetch_with<F>(&self, ticket: FetchTicket, build: F) -> bool
    where
        F: FnOnce(Option<&QueryData>) -> QueryData,
    {
        {
            let mut entry = match self.entries.get_mut(&ticket.key) {
                Some(entry) => entry,
                None => return false,
            };
            if entry.fetching == Some(ticket.generation) {
                entry.fetching = None;
            }
            if entry.generation == ticket.generation {
                if !entry.pending.is_empty() {
                    debug!(key = ?ticket.key, "discarding fetch that raced a pending mutation");
                    entry.stale = true;
                    return false;
                }
                let data = build(entry.base.as_ref());
                entry.base = Some(data);
                entry.stale = false;
                entry.recompute();
                return true;
            }
        }
        debug!(key = ?ticket.key, "discarding result of superseded fetch");
        self.prune(&ticket.key);
        false
    }

    /// Fetch `key` through `fetcher` and store the result unless the fetch
    /// was cancelled meanwhile. Returns the value visible afterwards, or the
    /// fetched value when nothing is cached.
    pub async fn fetch<F>(&self, key: &QueryKey, fetcher: F) -> Result<QueryData, Error>
    where
        F: Future<Output = Result<QueryData, Error>>,
    {
        let ticket = self.begin_fetch(key);
        self.fetch_as(ticket, fetcher).await
    }

    /// Run `fetcher` for an already started fetch.
    pub async fn fetch_as<F>(&self, ticket: FetchTicket, fetcher: F) -> Result<QueryData, Error>
    where
        F: Future<Output = Result<QueryData, Error>>,
    {
        let key = ticket.key.clone();
        match fetcher.await {
            Ok(data) => {
                self.complete_fetch(ticket, data.clone());
                Ok(self.get(&key).unwrap_or(data))
            }
            Err(err) => {
                self.abandon_fetch(ticket);
                Err(err)
            }
        }
    }

    /// Record an optimistic update. Cancels in-flight fetches for the key and
    /// returns the rollback snapshot: the value visible right before.
    pub(crate) fn push_update(
        &self,
        key: &QueryKey,
        id: MutationId,
        apply: Updater,
    ) -> Option<QueryData> {
        let mut entry = self.entry(key);
        entry.restart(self.next_generation());
        let snapshot = entry.visible.clone();
        let at = entry.pending.partition_point(|u| u.id < id);
        entry.pending.insert(
            at,
            PendingUpdate {
                id,
                snapshot: snapshot.clone(),
                apply,
                confirmed: false,
            },
        );
        entry.recompute();
        trace!(?key, %id, pending = entry.pending.len(), "optimistic update applied");
        snapshot
    }

    /// The server accepted mutation `id`. `reconcile` merges server truth
    /// into the optimistic value. Fetches begun before this point may carry
    /// pre-mutation data and are superseded.
    pub(crate) fn confirm_update(&self, key: &QueryKey, id: MutationId, reconcile: Option<Updater>) {
        let mut entry = match self.entries.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };
        if let Some(update) = entry.pending.iter_mut().find(|u| u.id == id) {
            if let Some(reconcile) = reconcile {
                let apply = update.apply.clone();
                update.apply = Arc::new(move |old: Option<&QueryData>| {
                    let optimistic = apply(old);
                    reconcile(optimistic.as_ref())
                });
            }
            update.confirmed = true;
            update.snapshot = None;
        }
        entry.restart(self.next_generation());
        entry.fold_confirmed();
        entry.recompute();
        entry.stale = true;
    }

    /// Mutation `id` failed or was abandoned. Drops it from the log; when no
    /// other update touched the key meanwhile the entry equals its snapshot.
    pub(crate) fn discard_update(&self, key: &QueryKey, id: MutationId) -> bool {
        let removed = {
            let mut entry = match self.entries.get_mut(key) {
                Some(entry) => entry,
                None => return false,
            };
            let before = entry.pending.len();
            entry.pending.retain(|u| u.id != id);
            entry.restart(self.next_generation());
            entry.fold_confirmed();
            entry.recompute();
            entry.pending.len() != before
        };
        self.prune(key);
        removed
    }

    /// Number of unsettled optimistic updates on `key`.
    pub fn pending_count(&self, key: &QueryKey) -> usize {
        self.entries.get(key).map_or(0, |entry| {
            entry.pending.iter().filter(|u| !u.confirmed).count()
        })
    }

    /// Rollback snapshot held for mutation `id` on `key`, if it is still
    /// unsettled. The inner `None` means the entry was empty at its start.
    pub fn snapshot(&self, key: &QueryKey, id: MutationId) -> Option<Option<QueryData>> {
        self.entries.get(key).and_then(|entry| {
            entry
                .pending
                .iter()
                .find(|u| u.id == id && !u.confirmed)
                .map(|u| u.snapshot.clone())
        })
    }
}
