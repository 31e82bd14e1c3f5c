//! Engine event stream.
//!
//! Every persisted step transition and every run completion is published
//! on a broadcast channel. Front ends subscribe to drive prompts for
//! manual steps and progress output; nothing in the engine depends on a
//! subscriber being present.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::run::{RunStatus, StepState};
use crate::workflow::ExecutionMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StepChanged {
        run_id: String,
        step: String,
        mode: ExecutionMode,
        state: StepState,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> &str {
        match self {
            EngineEvent::StepChanged { run_id, .. } | EngineEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::StepChanged {
            run_id: "r".into(),
            step: "a".into(),
            mode: ExecutionMode::Local,
            state: StepState::Running,
        });
        bus.emit(EngineEvent::RunFinished {
            run_id: "r".into(),
            status: RunStatus::Succeeded,
        });

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::StepChanged { .. }));
        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.run_id(), "r");
        assert!(matches!(finished, EngineEvent::RunFinished { status: RunStatus::Succeeded, .. }));
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        EventBus::default().emit(EngineEvent::RunFinished {
            run_id: "r".into(),
            status: RunStatus::Failed,
        });
    }
}
