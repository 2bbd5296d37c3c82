//! Process events and notifiers for observability.
//!
//! Every flow node transition the engine makes is reported as a
//! [`ProcessEvent`]. Consumers decide what to do with them: persist an audit
//! trail, stream to a UI, fan out on the [`SignalBus`], or ignore.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while processes are started, advanced and removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProcessEvent {
  /// Start nodes have been created.
  ProcessStarted { process_id: String, name: String },

  /// A successor (or start) node has been created.
  FlowNodeCreated {
    process_id: String,
    flow_node_id: String,
    element_id: String,
  },

  /// A node completed.
  FlowNodeProcessed {
    process_id: String,
    flow_node_id: String,
    element_id: String,
    output: serde_json::Value,
  },

  /// A node stalled, waiting on a condition or a sub-process.
  FlowNodeStandby {
    process_id: String,
    flow_node_id: String,
    element_id: String,
  },

  /// A node failed and its branch stopped.
  FlowNodeFailed {
    process_id: String,
    flow_node_id: String,
    element_id: String,
    error: String,
  },

  /// Open nodes were rejected because their process was removed.
  FlowNodesRejected {
    process_id: String,
    flow_node_ids: Vec<String>,
  },

  /// Deferred nodes became actionable after a save of their target.
  FlowNodesReactivated {
    target_type: String,
    target_id: String,
    flow_node_ids: Vec<String>,
  },

  /// Every node of the process is terminal.
  ProcessEnded { process_id: String },

  /// The process was removed.
  ProcessRemoved { process_id: String },
}

impl ProcessEvent {
  /// Topic the event is published under on the [`SignalBus`].
  pub fn topic(&self) -> &'static str {
    match self {
      Self::ProcessStarted { .. } => "process.started",
      Self::FlowNodeCreated { .. } => "flowNode.created",
      Self::FlowNodeProcessed { .. } => "flowNode.processed",
      Self::FlowNodeStandby { .. } => "flowNode.standby",
      Self::FlowNodeFailed { .. } => "flowNode.failed",
      Self::FlowNodesRejected { .. } => "flowNode.rejected",
      Self::FlowNodesReactivated { .. } => "flowNode.reactivated",
      Self::ProcessEnded { .. } => "process.ended",
      Self::ProcessRemoved { .. } => "process.removed",
    }
  }
}

/// Trait for receiving process events.
///
/// The engine calls `notify` synchronously from inside advancement, so
/// implementations must not block.
pub trait ProcessNotifier: Send + Sync {
  fn notify(&self, event: ProcessEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ProcessNotifier for NoopNotifier {
  fn notify(&self, _event: ProcessEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a locked process.
  sender: mpsc::UnboundedSender<ProcessEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ProcessEvent>) -> Self {
    Self { sender }
  }
}

impl ProcessNotifier for ChannelNotifier {
  fn notify(&self, event: ProcessEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

/// A message published on the [`SignalBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
  pub topic: String,
  pub payload: serde_json::Value,
}

type Listener = Arc<dyn Fn(&Signal) + Send + Sync>;

/// Topic-string message bus with registered listeners.
///
/// Process events are published under [`ProcessEvent::topic`]; the embedding
/// application can publish its own topics (`email.opened`, `link.clicked`)
/// through the same bus. Listeners registered under `*` receive everything.
#[derive(Clone, Default)]
pub struct SignalBus {
  listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
}

impl SignalBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a listener for a topic, or `*` for every topic.
  pub fn subscribe(&self, topic: impl Into<String>, listener: impl Fn(&Signal) + Send + Sync + 'static) {
    self
      .listeners
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .entry(topic.into())
      .or_default()
      .push(Arc::new(listener));
  }

  /// Deliver a signal to the topic's listeners, then the wildcard ones.
  /// Returns how many listeners were called.
  pub fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
    let listeners: Vec<Listener> = {
      let registry = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
      registry
        .get(topic)
        .into_iter()
        .chain(registry.get("*"))
        .flatten()
        .cloned()
        .collect()
    };

    let signal = Signal {
      topic: topic.to_string(),
      payload,
    };
    for listener in &listeners {
      listener(&signal);
    }
    tracing::trace!(topic, listeners = listeners.len(), "signal_published");
    listeners.len()
  }
}

impl std::fmt::Debug for SignalBus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let topics: Vec<String> = self
      .listeners
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect();
    f.debug_struct("SignalBus").field("topics", &topics).finish()
  }
}

impl ProcessNotifier for SignalBus {
  fn notify(&self, event: ProcessEvent) {
    match serde_json::to_value(&event) {
      Ok(payload) => {
        self.publish(event.topic(), payload);
      }
      Err(e) => tracing::warn!(error = %e, topic = event.topic(), "signal_encode_failed"),
    }
  }
}
