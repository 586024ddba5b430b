//! Outbound notifications for observers of a project orchestrator.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::orchestrator::SlotPhase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    PhaseChanged {
        task_id: String,
        from: SlotPhase,
        to: SlotPhase,
        attempt: u32,
    },
    TaskCompleted {
        task_id: String,
        merged_at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        reason: String,
        attempts: u32,
    },
    TaskBlocked {
        task_id: String,
        reason: String,
    },
    TaskRequeued {
        task_id: String,
        reason: String,
    },
    SlotRecovered {
        task_id: String,
        phase: SlotPhase,
        adopted: bool,
    },
    PushFailed {
        detail: String,
    },
    EpicReady {
        epic_id: String,
    },
}

/// Single-subscriber event channel.
///
/// A new subscription replaces the previous one. Emitting never fails: with
/// no subscriber, or a dropped receiver, the event is discarded.
#[derive(Default)]
pub struct Notifier {
    subscriber: Mutex<Option<mpsc::UnboundedSender<OrchestratorEvent>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OrchestratorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut slot) = self.subscriber.lock() {
            *slot = Some(tx);
        }
        rx
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        let Ok(mut slot) = self.subscriber.lock() else {
            return;
        };
        if let Some(tx) = slot.as_ref()
            && tx.send(event).is_err()
        {
            debug!("event subscriber went away");
            *slot = None;
        }
    }
}
