use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Claim, KeySpace, OccurrenceKey, ScheduleStore, SweepOutcome};
use crate::error::StoreError;
use crate::job::Definition;

const CHANNEL_CAPACITY: usize = 256;

/// Sorted set keyed by member, ordered by score.
#[derive(Debug, Default)]
struct SortedSet {
  scores: HashMap<String, i64>,
  ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
  fn upsert(&mut self, member: String, score: i64) {
    if let Some(old) = self.scores.insert(member.clone(), score) {
      self.ordered.remove(&(old, member.clone()));
    }
    self.ordered.insert((score, member));
  }

  fn remove(&mut self, member: &str) -> bool {
    match self.scores.remove(member) {
      Some(score) => {
        self.ordered.remove(&(score, member.to_string()));
        true
      }
      None => false,
    }
  }

  /// Removes and returns every entry scored at or below `max`, lowest first.
  fn pop_through(&mut self, max: i64) -> Vec<(i64, String)> {
    let mut popped = Vec::new();
    while let Some(first) = self.ordered.first() {
      if first.0 > max {
        break;
      }
      if let Some((score, member)) = self.ordered.pop_first() {
        self.scores.remove(&member);
        popped.push((score, member));
      }
    }
    popped
  }
}

#[derive(Debug, Default)]
struct State {
  hashes: HashMap<String, HashMap<String, String>>,
  sorted: HashMap<String, SortedSet>,
  lists: HashMap<String, VecDeque<String>>,
  /// Sets whose members expire individually.
  expiring: HashMap<String, HashMap<String, Instant>>,
  /// Plain string keys with optional expiry.
  strings: HashMap<String, (String, Option<Instant>)>,
}

impl State {
  fn hash(&mut self, key: &str) -> &mut HashMap<String, String> {
    self.hashes.entry(key.to_string()).or_default()
  }

  fn live_member(&mut self, key: &str, member: &str, now: Instant) -> bool {
    let Some(set) = self.expiring.get_mut(key) else {
      return false;
    };
    set.retain(|_, expires| *expires > now);
    set.contains_key(member)
  }

  fn expire_member(&mut self, key: &str, member: String, expires: Instant) {
    self.expiring.entry(key.to_string()).or_default().insert(member, expires);
  }

  fn live_string(&mut self, key: &str, now: Instant) -> Option<&String> {
    if let Some((_, Some(expires))) = self.strings.get(key) {
      if *expires <= now {
        self.strings.remove(key);
        return None;
      }
    }
    self.strings.get(key).map(|(value, _)| value)
  }
}

struct Inner {
  state: Mutex<State>,
  queue_ready: Notify,
  connected: watch::Sender<bool>,
  channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

/// In-process [`ScheduleStore`].
///
/// Each operation runs under one mutex, which gives it the same atomicity as
/// a server-side script. Clones share state, so several scheduler nodes built
/// over clones of one `MemoryStore` behave like a cluster over one server.
/// Expiry uses `tokio::time::Instant` and therefore follows paused test time.
#[derive(Clone)]
pub struct MemoryStore {
  inner: Arc<Inner>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for MemoryStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MemoryStore")
      .field("connected", &*self.inner.connected.borrow())
      .finish_non_exhaustive()
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    let (connected, _) = watch::channel(true);
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        queue_ready: Notify::new(),
        connected,
        channels: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Simulates losing (`false`) or regaining (`true`) the connection.
  ///
  /// While disconnected every operation fails with [`StoreError::Disconnected`],
  /// blocked claims return that error and subscriptions end.
  pub fn set_connected(&self, connected: bool) {
    self.inner.connected.send_replace(connected);
    if !connected {
      self.inner.channels.lock().clear();
    }
    debug!(connected, "Memory store connectivity changed.");
  }

  pub fn is_connected(&self) -> bool {
    *self.inner.connected.borrow()
  }

  /// Drops every key, as if the server had been flushed.
  pub fn flush_all(&self) {
    *self.inner.state.lock() = State::default();
    debug!("Memory store flushed.");
  }

  /// Due time of the waiting entry for `member`, if any.
  pub fn waiting_due(&self, keys: &KeySpace, member: &str) -> Option<DateTime<Utc>> {
    let state = self.inner.state.lock();
    let score = *state.sorted.get(&keys.waiting)?.scores.get(member)?;
    DateTime::from_timestamp(score, 0)
  }

  pub fn waiting_len(&self, keys: &KeySpace) -> usize {
    let state = self.inner.state.lock();
    state.sorted.get(&keys.waiting).map_or(0, |set| set.scores.len())
  }

  pub fn queued_len(&self, keys: &KeySpace) -> usize {
    let state = self.inner.state.lock();
    state.lists.get(&keys.queued).map_or(0, VecDeque::len)
  }

  /// Pushes a raw id onto `queued`, bypassing the waiting set.
  pub fn enqueue_raw(&self, keys: &KeySpace, id: impl Into<String>) {
    self
      .inner
      .state
      .lock()
      .lists
      .entry(keys.queued.clone())
      .or_default()
      .push_back(id.into());
    self.inner.queue_ready.notify_waiters();
  }

  fn ensure_connected(&self) -> Result<(), StoreError> {
    if self.is_connected() {
      Ok(())
    } else {
      Err(StoreError::Disconnected)
    }
  }

  fn decode(raw: &str) -> Result<Definition, StoreError> {
    Ok(serde_json::from_str(raw)?)
  }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
  async fn get_definition(&self, keys: &KeySpace, name: &str) -> Result<Option<Definition>, StoreError> {
    self.ensure_connected()?;
    let raw = self.inner.state.lock().hash(&keys.schedules).get(name).cloned();
    raw.as_deref().map(Self::decode).transpose()
  }

  async fn all_definitions(&self, keys: &KeySpace) -> Result<Vec<Definition>, StoreError> {
    self.ensure_connected()?;
    let raws: Vec<String> = self.inner.state.lock().hash(&keys.schedules).values().cloned().collect();
    let mut definitions = raws.iter().map(|raw| Self::decode(raw)).collect::<Result<Vec<_>, _>>()?;
    definitions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(definitions)
  }

  async fn create_definition(&self, keys: &KeySpace, definition: &Definition) -> Result<bool, StoreError> {
    self.ensure_connected()?;
    let encoded = serde_json::to_string(definition)?;
    let mut state = self.inner.state.lock();
    let hash = state.hash(&keys.schedules);
    if hash.contains_key(&definition.name) {
      return Ok(false);
    }
    hash.insert(definition.name.clone(), encoded);
    Ok(true)
  }

  async fn replace_definition(
    &self,
    keys: &KeySpace,
    definition: &Definition,
  ) -> Result<Option<Definition>, StoreError> {
    self.ensure_connected()?;
    let encoded = serde_json::to_string(definition)?;
    let previous = self
      .inner
      .state
      .lock()
      .hash(&keys.schedules)
      .insert(definition.name.clone(), encoded);
    previous.as_deref().map(Self::decode).transpose()
  }

  async fn save_progress(&self, keys: &KeySpace, definition: &Definition) -> Result<Option<Definition>, StoreError> {
    self.ensure_connected()?;
    let mut state = self.inner.state.lock();
    let hash = state.hash(&keys.schedules);
    let Some(current) = hash.get(&definition.name) else {
      return Ok(None);
    };
    let mut stored = Self::decode(current)?;
    if stored.version_hash != definition.version_hash {
      return Ok(None);
    }
    stored.occurrence = definition.occurrence.clone();
    stored.times_ran = definition.times_ran;
    stored.last_ran = definition.last_ran;
    stored.last_due = definition.last_due;
    hash.insert(stored.name.clone(), serde_json::to_string(&stored)?);
    Ok(Some(stored))
  }

  async fn delete_definition(&self, keys: &KeySpace, name: &str) -> Result<Option<Definition>, StoreError> {
    self.ensure_connected()?;
    let removed = self.inner.state.lock().hash(&keys.schedules).remove(name);
    removed.as_deref().map(Self::decode).transpose()
  }

  async fn schedule_occurrence(&self, keys: &KeySpace, occurrence: &OccurrenceKey) -> Result<bool, StoreError> {
    self.ensure_connected()?;
    let id = occurrence.id();
    let now = Instant::now();
    let mut state = self.inner.state.lock();
    if state.live_member(&keys.active, &id, now) || state.live_member(&keys.stalling, &id, now) {
      trace!(occurrence = %id, "Occurrence already claimed, not rescheduling.");
      return Ok(false);
    }
    state
      .sorted
      .entry(keys.waiting.clone())
      .or_default()
      .upsert(occurrence.member(), occurrence.due.timestamp());
    Ok(true)
  }

  async fn remove_waiting(&self, keys: &KeySpace, member: &str) -> Result<bool, StoreError> {
    self.ensure_connected()?;
    let mut state = self.inner.state.lock();
    Ok(state.sorted.get_mut(&keys.waiting).is_some_and(|set| set.remove(member)))
  }

  async fn sweep(
    &self,
    keys: &KeySpace,
    now: DateTime<Utc>,
    node_id: &str,
    lock_ttl: StdDuration,
  ) -> Result<SweepOutcome, StoreError> {
    self.ensure_connected()?;
    let instant = Instant::now();
    let moved = {
      let mut state = self.inner.state.lock();
      if let Some(holder) = state.live_string(&keys.lock, instant) {
        if holder != node_id {
          return Ok(SweepOutcome::Locked {
            holder: holder.clone(),
          });
        }
      }
      state
        .strings
        .insert(keys.lock.clone(), (node_id.to_string(), Some(instant + lock_ttl)));

      let flushed = state.live_string(&keys.hello, instant).is_none();
      if flushed {
        state.strings.insert(keys.hello.clone(), (node_id.to_string(), None));
      }

      let due = state
        .sorted
        .get_mut(&keys.waiting)
        .map(|set| set.pop_through(now.timestamp()))
        .unwrap_or_default();
      let queue = state.lists.entry(keys.queued.clone()).or_default();
      for (score, member) in &due {
        queue.push_back(format!("{member}{}{score}", super::KEY_SEPARATOR));
      }
      (due.len(), flushed)
    };

    if moved.0 > 0 {
      self.inner.queue_ready.notify_waiters();
    }
    Ok(SweepOutcome::Swept {
      moved: moved.0,
      flushed: moved.1,
    })
  }

  async fn touch_sentinel(&self, keys: &KeySpace, node_id: &str) -> Result<bool, StoreError> {
    self.ensure_connected()?;
    let mut state = self.inner.state.lock();
    if state.live_string(&keys.hello, Instant::now()).is_some() {
      return Ok(false);
    }
    state.strings.insert(keys.hello.clone(), (node_id.to_string(), None));
    Ok(true)
  }

  async fn claim(&self, keys: &KeySpace, lock_time: StdDuration) -> Result<Claim, StoreError> {
    let mut connected = self.inner.connected.subscribe();
    loop {
      let notified = self.inner.queue_ready.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      self.ensure_connected()?;
      {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        while let Some(id) = state.lists.get_mut(&keys.queued).and_then(VecDeque::pop_front) {
          let Some(occurrence) = OccurrenceKey::parse_id(&id) else {
            warn!(occurrence = %id, "Dropping malformed occurrence id from queue.");
            continue;
          };
          if state.live_member(&keys.active, &id, now) || state.live_member(&keys.stalling, &id, now) {
            return Ok(Claim::Redelivered(occurrence));
          }
          state.expire_member(&keys.active, id, now + lock_time);
          return Ok(Claim::Fresh(occurrence));
        }
      }

      tokio::select! {
        _ = &mut notified => {}
        changed = connected.changed() => {
          if changed.is_err() {
            return Err(StoreError::Disconnected);
          }
        }
      }
    }
  }

  async fn complete(
    &self,
    keys: &KeySpace,
    occurrence: &OccurrenceKey,
    lock_time: StdDuration,
  ) -> Result<(), StoreError> {
    self.ensure_connected()?;
    let id = occurrence.id();
    let now = Instant::now();
    let mut state = self.inner.state.lock();
    if let Some(active) = state.expiring.get_mut(&keys.active) {
      active.remove(&id);
    }
    state.expire_member(&keys.stalling, id, now + lock_time);
    Ok(())
  }

  async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
    self.ensure_connected()?;
    let channels = self.inner.channels.lock();
    Ok(
      channels
        .get(channel)
        .map_or(0, |sender| sender.send(payload).unwrap_or(0)),
    )
  }

  async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
    self.ensure_connected()?;
    let receiver = self
      .inner
      .channels
      .lock()
      .entry(channel.to_string())
      .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
      .subscribe();

    let messages = stream::unfold(receiver, |mut receiver| async move {
      loop {
        match receiver.recv().await {
          Ok(message) => return Some((message, receiver)),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "Subscriber lagged behind, messages dropped.");
          }
          Err(broadcast::error::RecvError::Closed) => return None,
        }
      }
    });
    Ok(messages.boxed())
  }

  async fn wait_ready(&self) {
    let mut connected = self.inner.connected.subscribe();
    // The sender lives as long as the store, so this only ends once connected.
    let _ = connected.wait_for(|connected| *connected).await;
  }
}
