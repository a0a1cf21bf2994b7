//! Tri-state cached value with optimistic write-through
//!
//! Backs each (device, pid) pair in the property engine. The cache never
//! stores a failed value: a failed read leaves the prior state untouched,
//! and a failed optimistic write rolls back to the value captured when the
//! update began (retargeted if an external set landed mid-update).

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Observable cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Never loaded
    NoValue,
    /// Loaded and inside the freshness window
    Fresh,
    /// Loaded but older than the TTL (or explicitly invalidated)
    StaleNeedsRefresh,
    /// An optimistic write is in flight; reads see the new value
    Updating,
}

/// Handle for one optimistic update. Obtained from [`CachedValue::begin_update`]
/// and consumed by `commit_update` / `fail_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOp {
    token: u64,
}

struct ActiveUpdate<T> {
    token: u64,
    value_new: T,
    /// Where a rollback lands; external sets during the update retarget this
    revert_to: T,
    revert_loaded_at: Option<Instant>,
    /// Whether an external confirmed set landed while the update ran
    retargeted: bool,
}

struct CacheInner<T> {
    value: T,
    /// `None` until the first set; a stopped (invalidated) entry keeps the
    /// timestamp but is forced stale
    loaded_at: Option<Instant>,
    invalidated: bool,
    update: Option<ActiveUpdate<T>>,
    next_token: u64,
}

pub struct CachedValue<T> {
    inner: Mutex<CacheInner<T>>,
    ttl: Duration,
}

impl<T: Clone + Default> CachedValue<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                value: T::default(),
                loaded_at: None,
                invalidated: false,
                update: None,
                next_token: 1,
            }),
            ttl,
        }
    }

    /// Current value; during an optimistic update this is the new value.
    pub fn value(&self) -> T {
        let inner = self.inner.lock();
        match &inner.update {
            Some(op) => op.value_new.clone(),
            None => inner.value.clone(),
        }
    }

    /// Last committed value, ignoring any in-flight optimistic update.
    pub fn committed_value(&self) -> T {
        self.inner.lock().value.clone()
    }

    pub fn state(&self) -> CacheState {
        let inner = self.inner.lock();
        if inner.loaded_at.is_none() {
            return CacheState::NoValue;
        }
        if inner.update.is_some() {
            return CacheState::Updating;
        }
        if self.needs_refresh(&inner) {
            CacheState::StaleNeedsRefresh
        } else {
            CacheState::Fresh
        }
    }

    /// Value and state in one consistent look.
    pub fn value_and_state(&self) -> (T, CacheState) {
        let inner = self.inner.lock();
        let state = if inner.loaded_at.is_none() {
            CacheState::NoValue
        } else if inner.update.is_some() {
            CacheState::Updating
        } else if self.needs_refresh(&inner) {
            CacheState::StaleNeedsRefresh
        } else {
            CacheState::Fresh
        };
        let value = match &inner.update {
            Some(op) => op.value_new.clone(),
            None => inner.value.clone(),
        };
        (value, state)
    }

    fn needs_refresh(&self, inner: &CacheInner<T>) -> bool {
        if inner.invalidated || self.ttl.is_zero() {
            return true;
        }
        match inner.loaded_at {
            Some(at) => at.elapsed() > self.ttl,
            None => true,
        }
    }

    /// Store a confirmed value and restart the freshness window. During an
    /// optimistic update this retargets the rollback value instead.
    pub fn set(&self, value: T) {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.update.as_mut() {
            op.revert_to = value;
            op.revert_loaded_at = Some(Instant::now());
            op.retargeted = true;
            return;
        }
        inner.value = value;
        inner.loaded_at = Some(Instant::now());
        inner.invalidated = false;
    }

    /// Force the entry stale without discarding the value.
    pub fn invalidate(&self) {
        self.inner.lock().invalidated = true;
    }

    /// Begin an optimistic write-through: readers observe `value` right
    /// away while the network write runs.
    pub fn begin_update(&self, value: T) -> UpdateOp {
        let mut inner = self.inner.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        let revert_to = inner.value.clone();
        let revert_loaded_at = inner.loaded_at;
        inner.update = Some(ActiveUpdate {
            token,
            value_new: value,
            revert_to,
            revert_loaded_at,
            retargeted: false,
        });
        UpdateOp { token }
    }

    /// Mark the optimistic update committed; the new value becomes the
    /// confirmed one with a fresh window. Returns the value a concurrent
    /// confirmed set stored while the update ran, if any, so the caller can
    /// reconcile (invalidate when it disagrees with the written value).
    pub fn commit_update(&self, op: UpdateOp) -> Option<T> {
        let mut inner = self.inner.lock();
        let matches = inner
            .update
            .as_ref()
            .map(|a| a.token == op.token)
            .unwrap_or(false);
        if !matches {
            return None;
        }
        let active = inner.update.take().expect("checked above");
        inner.value = active.value_new;
        inner.loaded_at = Some(Instant::now());
        inner.invalidated = false;
        active.retargeted.then_some(active.revert_to)
    }

    /// Roll the optimistic update back to the captured prior value.
    pub fn fail_update(&self, op: UpdateOp) {
        let mut inner = self.inner.lock();
        let matches = inner
            .update
            .as_ref()
            .map(|a| a.token == op.token)
            .unwrap_or(false);
        if !matches {
            return;
        }
        let active = inner.update.take().expect("checked above");
        inner.value = active.revert_to;
        // Rolling back does not refresh the window; keep the old stamp.
        inner.loaded_at = active.revert_loaded_at.or(inner.loaded_at);
    }
}
