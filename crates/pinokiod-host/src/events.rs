use pinokiod_core::{Event, EventKind};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out of host events to RPC subscribers. Per-subscriber ordering is
/// the broadcast channel's; slow consumers drop from the head, never block
/// producers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind, command: Option<String>) {
        let event = Event::new(kind).with_command(command);
        // No subscribers is not an error; events are best-effort fan-out.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinokiod_core::AppState;

    #[tokio::test]
    async fn subscribers_see_events_in_emit_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(
            EventKind::StateChanged {
                app_id: "a".into(),
                from: AppState::Absent,
                to: AppState::Installing,
                detail: None,
            },
            Some("cmd-7".into()),
        );
        bus.emit(
            EventKind::LogLine {
                app_id: "a".into(),
                stream: "stdout".into(),
                line: "hello".into(),
            },
            None,
        );
        let first = rx.recv().await.unwrap();
        assert_eq!(first.command.as_deref(), Some("cmd-7"));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.kind, EventKind::LogLine { .. }));
    }
}
