// Rate and moving-average items answer in O(1) because background samplers
// keep a bounded, time-indexed history per subject (disk device, cpu id).
// The longest window is 900 seconds at a 1-second cadence, hence the extra
// slot: when the requested window exceeds the collected history, the oldest
// entry is the one consulted.

use std::{cmp, collections, hash, sync, time};

pub const MAX_SHIFT: u64 = 900;
pub const INTERVAL: time::Duration = time::Duration::from_secs(1);

static EPOCH: once_cell::sync::Lazy<time::Instant> = once_cell::sync::Lazy::new(time::Instant::now);

/// Seconds on the monotonic clock, relative to the first call. Samplers stamp
/// entries with it and items compare against it, so the origin is irrelevant.
pub fn now() -> u64 {
  EPOCH.elapsed().as_secs()
}

/// A bounded deque of `(value, timestamp)` entries, newest first. One sampler
/// task is the only writer; request workers read concurrently and copy the
/// entry out under the same short critical section.
#[derive(Debug)]
pub struct History<T> {
  entries: sync::Mutex<collections::VecDeque<(T, u64)>>,
  capacity: usize,
}

impl<T> History<T>
where
  T: Clone,
{
  pub fn new(max_shift: u64) -> Self {
    let capacity = max_shift as usize + 1;
    Self {
      entries: sync::Mutex::new(collections::VecDeque::with_capacity(capacity)),
      capacity,
    }
  }

  pub fn push(&self, value: T, timestamp: u64) {
    let mut entries = self.entries.lock().unwrap();
    if entries.len() == self.capacity {
      entries.pop_back();
    }
    entries.push_front((value, timestamp));
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().unwrap().is_empty()
  }

  /// The newest entry at least `shift` seconds old at `now`. When nothing is
  /// old enough yet the oldest entry stands in; `None` only for an empty
  /// history.
  pub fn shifted(&self, shift: u64, now: u64) -> Option<(T, u64)> {
    let entries = self.entries.lock().unwrap();
    for (value, timestamp) in entries.iter() {
      if now.saturating_sub(*timestamp) >= shift {
        return Some((value.clone(), *timestamp));
      }
    }
    entries.back().cloned()
  }

  /// The entry `shift` pushes behind the newest, clamped to the oldest.
  /// `None` only for an empty history.
  pub fn at_offset(&self, shift: usize) -> Option<T> {
    let entries = self.entries.lock().unwrap();
    if entries.is_empty() {
      return None;
    }
    entries
      .get(cmp::min(shift, entries.len() - 1))
      .map(|(value, _)| value.clone())
  }
}

/// Per-subject histories, materialized lazily as the sampler first sees a
/// subject (devices appear at runtime, cpus are stable but this doesn't need
/// to care).
#[derive(Debug)]
pub struct SubjectHistory<K, T> {
  histories: sync::RwLock<collections::HashMap<K, sync::Arc<History<T>>>>,
  max_shift: u64,
}

impl<K, T> SubjectHistory<K, T>
where
  K: Clone + Eq + hash::Hash,
  T: Clone,
{
  pub fn new(max_shift: u64) -> Self {
    Self {
      histories: sync::RwLock::new(collections::HashMap::new()),
      max_shift,
    }
  }

  fn subject(&self, key: &K) -> sync::Arc<History<T>> {
    if let Some(history) = self.histories.read().unwrap().get(key) {
      return sync::Arc::clone(history);
    }
    let mut histories = self.histories.write().unwrap();
    sync::Arc::clone(
      histories
        .entry(key.clone())
        .or_insert_with(|| sync::Arc::new(History::new(self.max_shift))),
    )
  }

  pub fn push(&self, key: &K, value: T, timestamp: u64) {
    self.subject(key).push(value, timestamp);
  }

  pub fn shifted(&self, key: &K, shift: u64, now: u64) -> Option<(T, u64)> {
    self.histories.read().unwrap().get(key)?.shifted(shift, now)
  }

  pub fn at_offset(&self, key: &K, shift: usize) -> Option<T> {
    self.histories.read().unwrap().get(key)?.at_offset(shift)
  }
}
