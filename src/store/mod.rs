//! The shared store seam.
//!
//! Every cross-node guarantee of the scheduler rests on the atomic operations
//! declared by [`ScheduleStore`]. A backend must implement each method as a
//! single atomic step (a server-side script on a key-value server, a mutex in
//! [`MemoryStore`]).

mod memory;

pub use memory::MemoryStore;

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::StoreError;
use crate::job::Definition;

/// Separator between the parts of occurrence members and ids.
pub const KEY_SEPARATOR: &str = "|||";

/// Fully qualified key names for one scheduler namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
  /// Hash: definition name to serialized definition.
  pub schedules: String,
  /// Sorted set: occurrence member to due timestamp.
  pub waiting: String,
  /// FIFO list of occurrence ids ready to run.
  pub queued: String,
  /// Occurrence ids currently claimed, with expiry.
  pub active: String,
  /// Recently completed occurrence ids, with expiry.
  pub stalling: String,
  /// Sweep mutex.
  pub lock: String,
  /// Flush-detection sentinel.
  pub hello: String,
}

impl KeySpace {
  /// Keys under `namespace`. Clustered deployments wrap the namespace in a
  /// hash tag (`{ns}:key`) so every key lands on the same shard.
  pub fn new(namespace: &str, clustered: bool) -> Self {
    let key = |suffix: &str| {
      if clustered {
        format!("{{{namespace}}}:{suffix}")
      } else {
        format!("{namespace}:{suffix}")
      }
    };
    Self {
      schedules: key("schedules"),
      waiting: key("waiting"),
      queued: key("queued"),
      active: key("active"),
      stalling: key("stalling"),
      lock: key("lock"),
      hello: key("hello"),
    }
  }
}

/// The `waiting` member shared by every occurrence of one definition version.
pub fn waiting_member(name: &str, version_hash: &str) -> String {
  format!("{name}{KEY_SEPARATOR}{version_hash}")
}

/// One scheduled instance of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OccurrenceKey {
  pub name: String,
  pub version_hash: String,
  pub due: DateTime<Utc>,
}

impl OccurrenceKey {
  pub fn new(name: impl Into<String>, version_hash: impl Into<String>, due: DateTime<Utc>) -> Self {
    Self {
      name: name.into(),
      version_hash: version_hash.into(),
      due,
    }
  }

  pub fn for_definition(definition: &Definition, due: DateTime<Utc>) -> Self {
    Self::new(&definition.name, &definition.version_hash, due)
  }

  /// Member of the `waiting` sorted set: `name|||versionHash`.
  pub fn member(&self) -> String {
    waiting_member(&self.name, &self.version_hash)
  }

  /// Occurrence-specific id used in `queued`, `active` and `stalling`:
  /// `name|||versionHash|||dueSeconds`.
  pub fn id(&self) -> String {
    format!("{}{KEY_SEPARATOR}{}", self.member(), self.due.timestamp())
  }

  /// Reverses [`member`](Self::member), attaching the given due time.
  pub fn parse_member(member: &str, due: DateTime<Utc>) -> Option<Self> {
    let (name, version_hash) = member.rsplit_once(KEY_SEPARATOR)?;
    Some(Self::new(name, version_hash, due))
  }

  /// Reverses [`id`](Self::id).
  pub fn parse_id(id: &str) -> Option<Self> {
    let (member, due) = id.rsplit_once(KEY_SEPARATOR)?;
    let due = DateTime::from_timestamp(due.parse().ok()?, 0)?;
    Self::parse_member(member, due)
  }
}

/// Result of one sweep attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
  /// Another node holds the sweep lock.
  Locked { holder: String },
  /// The lock was acquired (or refreshed) and `moved` entries were queued.
  /// `flushed` is set when the flush sentinel had to be recreated.
  Swept { moved: usize, flushed: bool },
}

/// An occurrence popped from `queued`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
  /// First delivery; the id is now held in `active`.
  Fresh(OccurrenceKey),
  /// The id was already active or recently completed; nothing to run.
  Redelivered(OccurrenceKey),
}

/// The shared key-value store holding definitions and occurrence queues.
///
/// All methods take the [`KeySpace`] of the calling scheduler so one backend
/// can serve several namespaces.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
  async fn get_definition(&self, keys: &KeySpace, name: &str) -> Result<Option<Definition>, StoreError>;

  async fn all_definitions(&self, keys: &KeySpace) -> Result<Vec<Definition>, StoreError>;

  /// Stores `definition` only if its name is free. Returns whether it was written.
  async fn create_definition(&self, keys: &KeySpace, definition: &Definition) -> Result<bool, StoreError>;

  /// Stores `definition` unconditionally, returning the one it replaced.
  async fn replace_definition(
    &self,
    keys: &KeySpace,
    definition: &Definition,
  ) -> Result<Option<Definition>, StoreError>;

  /// Merges the run bookkeeping of `definition` (`occurrence`, `times_ran`,
  /// `last_ran`, `last_due`) into the stored record while its version hash
  /// still matches. Every other field keeps its stored value.
  ///
  /// Returns the merged record, or `None` when the definition was removed or
  /// redefined.
  async fn save_progress(&self, keys: &KeySpace, definition: &Definition) -> Result<Option<Definition>, StoreError>;

  async fn delete_definition(&self, keys: &KeySpace, name: &str) -> Result<Option<Definition>, StoreError>;

  /// Upserts the waiting entry for `occurrence`, unless that exact occurrence
  /// is currently active or recently completed. Returns whether it was written.
  async fn schedule_occurrence(&self, keys: &KeySpace, occurrence: &OccurrenceKey) -> Result<bool, StoreError>;

  /// Removes the waiting entry for `member`. Returns whether one existed.
  async fn remove_waiting(&self, keys: &KeySpace, member: &str) -> Result<bool, StoreError>;

  /// Acquires (or, for the current holder, refreshes) the sweep lock and
  /// moves every waiting entry due at or before `now` into `queued`.
  async fn sweep(
    &self,
    keys: &KeySpace,
    now: DateTime<Utc>,
    node_id: &str,
    lock_ttl: StdDuration,
  ) -> Result<SweepOutcome, StoreError>;

  /// Creates the flush sentinel if it is missing. Returns whether it was created.
  async fn touch_sentinel(&self, keys: &KeySpace, node_id: &str) -> Result<bool, StoreError>;

  /// Blocks until an occurrence can be popped from `queued`, moving it to
  /// `active` with `lock_time` expiry. Fails with [`StoreError::Disconnected`]
  /// when the connection drops while waiting.
  async fn claim(&self, keys: &KeySpace, lock_time: StdDuration) -> Result<Claim, StoreError>;

  /// Moves `occurrence` from `active` into `stalling` for `lock_time`.
  async fn complete(
    &self,
    keys: &KeySpace,
    occurrence: &OccurrenceKey,
    lock_time: StdDuration,
  ) -> Result<(), StoreError>;

  /// Publishes `payload` on `channel`, returning the number of receivers.
  async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError>;

  /// Subscribes to `channel`. The stream ends when the connection drops.
  async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError>;

  /// Resolves once the store connection is usable.
  async fn wait_ready(&self);
}
