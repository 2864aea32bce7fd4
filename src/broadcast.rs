use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::error::StoreError;
use crate::job::Definition;
use crate::metrics::SchedulerMetrics;
use crate::store::ScheduleStore;
use crate::worker::{shutdown_requested, Executor};

/// Pause before retrying a subscription that failed for a reason other than
/// a lost connection.
const RESUBSCRIBE_DELAY: StdDuration = StdDuration::from_secs(1);

/// Payload published for every claimed run of a `multi` definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiEnvelope {
  /// Node that claimed the occurrence and already ran the job.
  pub origin: String,
  pub schedule: Definition,
}

/// Fans `multi` executions out to every node through the store's pub/sub.
#[derive(Clone)]
pub(crate) struct MultiBroadcaster {
  store: Arc<dyn ScheduleStore>,
  channel: String,
  node_id: String,
  metrics: SchedulerMetrics,
}

impl MultiBroadcaster {
  pub fn new(store: Arc<dyn ScheduleStore>, channel: String, node_id: String, metrics: SchedulerMetrics) -> Self {
    Self {
      store,
      channel,
      node_id,
      metrics,
    }
  }

  /// Publishes `definition` tagged with this node's id. Failures are logged.
  pub async fn publish(&self, definition: &Definition) {
    let envelope = MultiEnvelope {
      origin: self.node_id.clone(),
      schedule: definition.clone(),
    };
    let payload = match serde_json::to_string(&envelope) {
      Ok(payload) => payload,
      Err(e) => {
        error!(schedule = %definition.name, error = %e, "Failed to encode multi broadcast.");
        return;
      }
    };

    match self.store.publish(&self.channel, payload).await {
      Ok(receivers) => {
        SchedulerMetrics::incr(&self.metrics.multi_sent);
        debug!(schedule = %definition.name, channel = %self.channel, receivers, "Published multi broadcast.");
      }
      Err(e) => {
        SchedulerMetrics::incr(&self.metrics.store_errors);
        warn!(schedule = %definition.name, error = %e, "Failed to publish multi broadcast.");
      }
    }
  }

  /// Receives broadcasts until shutdown, running every one that originated
  /// on another node. Resubscribes whenever the subscription drops.
  pub async fn run(self, executor: Executor, mut shutdown_rx: watch::Receiver<bool>) {
    info!(node_id = %self.node_id, channel = %self.channel, "Broadcast listener started.");

    'subscribe: loop {
      match self.store.subscribe(&self.channel).await {
        Ok(mut messages) => loop {
          tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
              if shutdown_requested(changed, &shutdown_rx) {
                break 'subscribe;
              }
            }

            message = messages.next() => match message {
              Some(payload) => self.handle(&executor, &payload),
              None => {
                debug!(node_id = %self.node_id, "Broadcast subscription ended.");
                break;
              }
            }
          }
        },
        Err(StoreError::Disconnected) => {
          debug!(node_id = %self.node_id, "Store disconnected, cannot subscribe yet.");
        }
        Err(e) => {
          SchedulerMetrics::incr(&self.metrics.store_errors);
          error!(node_id = %self.node_id, error = %e, "Failed to subscribe to multi broadcasts.");
          tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
              if shutdown_requested(changed, &shutdown_rx) {
                break 'subscribe;
              }
            }

            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
          }
          continue;
        }
      }

      tokio::select! {
        biased;

        changed = shutdown_rx.changed() => {
          if shutdown_requested(changed, &shutdown_rx) {
            break 'subscribe;
          }
        }

        _ = self.store.wait_ready() => {
          trace!(node_id = %self.node_id, "Store ready, resubscribing to multi broadcasts.");
        }
      }
    }

    info!(node_id = %self.node_id, "Broadcast listener stopped.");
  }

  fn handle(&self, executor: &Executor, payload: &str) {
    let envelope: MultiEnvelope = match serde_json::from_str(payload) {
      Ok(envelope) => envelope,
      Err(e) => {
        warn!(error = %e, "Ignoring malformed multi broadcast.");
        return;
      }
    };
    if envelope.origin == self.node_id {
      trace!(schedule = %envelope.schedule.name, "Ignoring own multi broadcast.");
      return;
    }

    SchedulerMetrics::incr(&self.metrics.multi_received);
    debug!(
      schedule = %envelope.schedule.name,
      origin = %envelope.origin,
      "Running multi broadcast echo."
    );
    let executor = executor.clone();
    tokio::spawn(async move {
      let _ = executor.execute(&envelope.schedule, None).await;
    });
  }
}
