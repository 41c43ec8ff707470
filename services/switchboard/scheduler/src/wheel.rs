//! Hashed timer wheel keyed by owner-scoped deadlines.
//!
//! Every timer lives in `entries` under a fresh [`TimerId`]; its slot bucket
//! only holds the id. Cancelling removes the entry and the key's index entry,
//! leaving a stale id in the bucket that the next sweep skips, so both
//! schedule and cancel are O(1).
//!
//! A fired timer is not run on the sweeping task. Its callback is wrapped in
//! a job that first *claims* the key: the claim succeeds only if the key still
//! maps to the same timer id. A cancel or re-schedule that lands between the
//! sweep and the job makes the claim fail, so exactly one of cancel and fire
//! wins.

use crate::affinity::{Affinity, Job, RuntimeAffinity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Key of a deadline. Keys of one owner can be cancelled together and fire
/// on the owner's affinity.
pub trait TimerKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Owning entity, typically a session id
    type Owner: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Owner of this key
    fn owner(&self) -> Self::Owner;
}

/// Identity of one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Wheel geometry
#[derive(Debug, Clone)]
pub struct WheelConfig {
    /// Tick resolution
    pub tick: Duration,
    /// Slot count, rounded up to a power of two
    pub slots: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            slots: 512,
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Entry<K> {
    key: K,
    deadline_tick: u64,
    callback: Callback,
}

struct WheelState<K: TimerKey> {
    current_tick: u64,
    next_id: u64,
    slots: Vec<Vec<TimerId>>,
    entries: HashMap<TimerId, Entry<K>>,
    owners: HashMap<K::Owner, HashMap<K, TimerId>>,
    affinities: HashMap<K::Owner, Arc<dyn Affinity>>,
}

impl<K: TimerKey> WheelState<K> {
    /// Drop the key's index entry and its armed timer, if any
    fn unlink(&mut self, key: &K) -> Option<TimerId> {
        let owner = key.owner();
        let keys = self.owners.get_mut(&owner)?;
        let id = keys.remove(key)?;
        if keys.is_empty() {
            self.owners.remove(&owner);
        }
        self.entries.remove(&id);
        Some(id)
    }
}

struct Inner<K: TimerKey> {
    tick: Duration,
    mask: u64,
    origin: Instant,
    fallback: Arc<dyn Affinity>,
    state: Mutex<WheelState<K>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Keyed deadline scheduler.
///
/// Cloning is cheap; clones share the same wheel.
pub struct DeadlineScheduler<K: TimerKey> {
    inner: Arc<Inner<K>>,
}

impl<K: TimerKey> Clone for DeadlineScheduler<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: TimerKey> DeadlineScheduler<K> {
    /// Create a scheduler whose unbound owners run on the current runtime.
    /// Panics outside a tokio runtime.
    pub fn new(config: WheelConfig) -> Self {
        Self::with_fallback(config, Arc::new(RuntimeAffinity::current()))
    }

    /// Create a scheduler with an explicit affinity for unbound owners
    pub fn with_fallback(config: WheelConfig, fallback: Arc<dyn Affinity>) -> Self {
        let slots = config.slots.max(1).next_power_of_two();
        let tick = config.tick.max(Duration::from_millis(1));

        Self {
            inner: Arc::new(Inner {
                tick,
                mask: slots as u64 - 1,
                origin: Instant::now(),
                fallback,
                state: Mutex::new(WheelState {
                    current_tick: 0,
                    next_id: 0,
                    slots: vec![Vec::new(); slots],
                    entries: HashMap::new(),
                    owners: HashMap::new(),
                    affinities: HashMap::new(),
                }),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Arm `callback` to fire after `delay`, replacing any timer already
    /// armed for `key`
    pub fn schedule<F>(&self, key: K, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let elapsed = Instant::now().saturating_duration_since(self.inner.origin) + delay;
        let ticks = ceil_ticks(elapsed, self.inner.tick);

        let mut state = self.inner.state.lock();
        if let Some(old) = state.unlink(&key) {
            trace!(?key, ?old, "replacing armed timer");
        }

        let deadline_tick = ticks.max(state.current_tick + 1);
        let id = TimerId(state.next_id);
        state.next_id += 1;

        let slot = (deadline_tick & self.inner.mask) as usize;
        state.slots[slot].push(id);
        state
            .owners
            .entry(key.owner())
            .or_default()
            .insert(key.clone(), id);
        state.entries.insert(
            id,
            Entry {
                key,
                deadline_tick,
                callback: Box::new(callback),
            },
        );
        id
    }

    /// Cancel the timer armed for `key`. Returns whether one was armed; an
    /// unknown key is a no-op.
    pub fn cancel(&self, key: &K) -> bool {
        self.inner.state.lock().unlink(key).is_some()
    }

    /// Cancel every timer of `owner` and forget its affinity binding
    pub fn cancel_owner(&self, owner: &K::Owner) -> usize {
        let mut state = self.inner.state.lock();
        state.affinities.remove(owner);
        let Some(keys) = state.owners.remove(owner) else {
            return 0;
        };
        for id in keys.values() {
            state.entries.remove(id);
        }
        debug!(?owner, cancelled = keys.len(), "cancelled owner timers");
        keys.len()
    }

    /// Whether a timer is armed (or fired but not yet run) for `key`
    pub fn is_scheduled(&self, key: &K) -> bool {
        let state = self.inner.state.lock();
        state
            .owners
            .get(&key.owner())
            .is_some_and(|keys| keys.contains_key(key))
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.inner.state.lock().owners.values().map(HashMap::len).sum()
    }

    /// Whether no key is live
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().owners.is_empty()
    }

    /// Route future firings for `owner` to `affinity`. Timers already armed
    /// fire on whatever the owner is bound to when they expire.
    pub fn rebind_affinity(&self, owner: K::Owner, affinity: Arc<dyn Affinity>) {
        self.inner.state.lock().affinities.insert(owner, affinity);
    }

    /// Sweep every slot up to `now` and hand expired callbacks to their
    /// owners' affinities
    pub fn advance_to(&self, now: Instant) {
        let target = (now.saturating_duration_since(self.inner.origin).as_nanos()
            / self.inner.tick.as_nanos()) as u64;

        let mut state = self.inner.state.lock();
        if target <= state.current_tick {
            return;
        }

        // a full rotation visits every slot once
        let steps = (target - state.current_tick).min(self.inner.mask + 1);
        let WheelState {
            current_tick,
            slots,
            entries,
            affinities,
            ..
        } = &mut *state;

        let mut due = Vec::new();
        for step in 1..=steps {
            let slot = ((*current_tick + step) & self.inner.mask) as usize;
            slots[slot].retain(|id| {
                let expired = match entries.get(id) {
                    None => return false,
                    Some(entry) => entry.deadline_tick <= target,
                };
                if !expired {
                    return true;
                }
                if let Some(entry) = entries.remove(id) {
                    due.push((*id, entry));
                }
                false
            });
        }
        *current_tick = target;

        due.sort_by_key(|(id, entry)| (entry.deadline_tick, *id));
        let jobs: Vec<(Arc<dyn Affinity>, Job)> = due
            .into_iter()
            .map(|(id, entry)| {
                let affinity = affinities
                    .get(&entry.key.owner())
                    .cloned()
                    .unwrap_or_else(|| self.inner.fallback.clone());
                (affinity, self.fire_job(id, entry))
            })
            .collect();
        drop(state);

        for (affinity, job) in jobs {
            affinity.execute(job);
        }
    }

    fn fire_job(&self, id: TimerId, entry: Entry<K>) -> Job {
        let inner = self.inner.clone();
        let Entry { key, callback, .. } = entry;
        Box::new(move || {
            if claim(&inner, &key, id) {
                trace!(?key, "timer fired");
                callback();
            } else {
                trace!(?key, "timer cancelled before it ran");
            }
        })
    }

    /// Spawn the background task that ticks the wheel. Calling it again
    /// while running has no effect.
    pub fn start(&self) {
        let mut driver = self.inner.driver.lock();
        if driver.is_some() {
            return;
        }

        let scheduler = self.clone();
        let tick = self.inner.tick;
        *driver = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                scheduler.advance_to(Instant::now());
            }
        }));
        debug!(tick_ms = tick.as_millis() as u64, "deadline scheduler started");
    }

    /// Stop the background task and drop every armed timer
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.driver.lock().take() {
            handle.abort();
        }

        let mut state = self.inner.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.owners.clear();
        state.affinities.clear();
        for slot in state.slots.iter_mut() {
            slot.clear();
        }
        debug!(dropped, "deadline scheduler shut down");
    }
}

/// Take ownership of a fired key. Fails if it was cancelled or replaced.
fn claim<K: TimerKey>(inner: &Inner<K>, key: &K, id: TimerId) -> bool {
    let mut state = inner.state.lock();
    let owner = key.owner();
    let Some(keys) = state.owners.get_mut(&owner) else {
        return false;
    };
    if keys.get(key) != Some(&id) {
        return false;
    }
    keys.remove(key);
    if keys.is_empty() {
        state.owners.remove(&owner);
    }
    true
}

fn ceil_ticks(elapsed: Duration, tick: Duration) -> u64 {
    let tick = tick.as_nanos();
    elapsed.as_nanos().div_ceil(tick) as u64
}
