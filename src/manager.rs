use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{ScheduleError, StoreError};
use crate::job::{Definition, DefinitionInput};
use crate::occurrence::compute_next_after_run;
use crate::store::{waiting_member, KeySpace, OccurrenceKey, ScheduleStore};

/// Definition persistence and occurrence scheduling against the shared store.
///
/// Shared by the public handle, the sweeper (default re-registration) and the
/// worker (rescheduling after each claim). Cloning shares the store and clock.
#[derive(Clone)]
pub(crate) struct DefinitionManager {
  store: Arc<dyn ScheduleStore>,
  keys: KeySpace,
  clock: Arc<dyn Clock>,
  lock_time: StdDuration,
}

impl DefinitionManager {
  pub fn new(
    store: Arc<dyn ScheduleStore>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    lock_time: StdDuration,
  ) -> Self {
    Self {
      store,
      keys,
      clock,
      lock_time,
    }
  }

  pub fn store(&self) -> &Arc<dyn ScheduleStore> {
    &self.store
  }

  pub fn keys(&self) -> &KeySpace {
    &self.keys
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn lock_time(&self) -> StdDuration {
    self.lock_time
  }

  /// Validates `input` and persists it.
  ///
  /// With `create_only`, an existing definition of the same name is returned
  /// untouched. Otherwise it is replaced: a changed version hash resets the
  /// run history and moves the waiting entry to the new version; an unchanged
  /// hash keeps the timing state and only replaces the payload fields.
  pub async fn create_or_update(
    &self,
    input: DefinitionInput,
    create_only: bool,
  ) -> Result<Definition, ScheduleError> {
    debug!(schedule = %input.name, create_only, "create_or_update schedule");
    let definition = Definition::from_input(input, self.now())?;

    if create_only {
      if self.store.create_definition(&self.keys, &definition).await? {
        info!(schedule = %definition.name, next = ?definition.next(), "Created schedule.");
        self.enqueue_first(&definition).await?;
        return Ok(definition);
      }
      let existing = self.store.get_definition(&self.keys, &definition.name).await?;
      return Ok(existing.unwrap_or(definition));
    }

    match self.store.get_definition(&self.keys, &definition.name).await? {
      None => {
        self.store.replace_definition(&self.keys, &definition).await?;
        info!(schedule = %definition.name, next = ?definition.next(), "Created schedule.");
        self.enqueue_first(&definition).await?;
        Ok(definition)
      }
      Some(existing) if existing.version_hash != definition.version_hash => {
        self.store.replace_definition(&self.keys, &definition).await?;
        self
          .store
          .remove_waiting(&self.keys, &waiting_member(&existing.name, &existing.version_hash))
          .await?;
        info!(
          schedule = %definition.name,
          previous = %existing.version_hash,
          version = %definition.version_hash,
          "Replaced schedule timing."
        );
        self.enqueue_first(&definition).await?;
        Ok(definition)
      }
      Some(existing) => {
        let mut merged = existing;
        merged.runs = definition.runs;
        merged.data = definition.data;
        merged.multi = definition.multi;
        merged.enabled = definition.enabled;
        merged.times = definition.times;
        merged.forward_dates_only = definition.forward_dates_only;
        self.store.replace_definition(&self.keys, &merged).await?;
        debug!(schedule = %merged.name, enabled = merged.enabled, "Updated schedule payload.");
        if merged.enabled {
          self.schedule_next(&mut merged).await?;
        } else {
          self
            .store
            .remove_waiting(&self.keys, &waiting_member(&merged.name, &merged.version_hash))
            .await?;
        }
        Ok(merged)
      }
    }
  }

  /// Removes a definition and its waiting entry. Returns whether it existed.
  pub async fn destroy(&self, name: &str) -> Result<bool, StoreError> {
    match self.store.delete_definition(&self.keys, name).await? {
      Some(existing) => {
        self
          .store
          .remove_waiting(&self.keys, &waiting_member(&existing.name, &existing.version_hash))
          .await?;
        info!(schedule = %name, "Destroyed schedule.");
        Ok(true)
      }
      None => Ok(false),
    }
  }

  pub async fn find_one(&self, name: &str) -> Result<Option<Definition>, StoreError> {
    self.store.get_definition(&self.keys, name).await
  }

  pub async fn find_all(&self) -> Result<Vec<Definition>, StoreError> {
    self.store.all_definitions(&self.keys).await
  }

  /// Computes the next due time for `definition`, records it and inserts the
  /// waiting entry. Safe to call repeatedly: an identical occurrence is a no-op.
  ///
  /// On return `definition` holds the stored record, so payload changes made
  /// by other nodes since it was loaded are picked up. Nothing is scheduled
  /// when the stored definition has since moved to a new version, was removed
  /// or was disabled.
  pub async fn schedule_next(&self, definition: &mut Definition) -> Result<Option<DateTime<Utc>>, StoreError> {
    let next = compute_next_after_run(definition, self.now());
    definition.occurrence.set_next(next);

    match self.store.save_progress(&self.keys, definition).await? {
      Some(stored) => *definition = stored,
      None => {
        debug!(schedule = %definition.name, "Schedule changed or removed, not rescheduling.");
        return Ok(None);
      }
    }
    if !definition.enabled {
      debug!(schedule = %definition.name, "Schedule disabled, not rescheduling.");
      return Ok(None);
    }

    match next {
      Some(due) => {
        let occurrence = OccurrenceKey::for_definition(definition, due);
        let added = self.store.schedule_occurrence(&self.keys, &occurrence).await?;
        debug!(schedule = %definition.name, %due, added, "Scheduled next occurrence.");
        Ok(Some(due))
      }
      None => {
        info!(schedule = %definition.name, "Schedule has no further occurrences.");
        Ok(None)
      }
    }
  }

  /// Create-only registration of every configured default. Failures are
  /// logged per definition and do not stop the rest.
  pub async fn register_defaults(&self, defaults: &[DefinitionInput]) -> usize {
    let mut registered = 0;
    for input in defaults {
      let name = input.name.clone();
      match self.create_or_update(input.clone(), true).await {
        Ok(_) => registered += 1,
        Err(ScheduleError::Store(e)) => {
          warn!(schedule = %name, error = %e, "Could not register default schedule.");
        }
        Err(e) => {
          error!(schedule = %name, error = %e, "Invalid default schedule.");
        }
      }
    }
    registered
  }

  async fn enqueue_first(&self, definition: &Definition) -> Result<(), StoreError> {
    if !definition.enabled {
      return Ok(());
    }
    if let Some(due) = definition.next() {
      self
        .store
        .schedule_occurrence(&self.keys, &OccurrenceKey::for_definition(definition, due))
        .await?;
    }
    Ok(())
  }
}
