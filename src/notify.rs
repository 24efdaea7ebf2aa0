use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::model::{Event, MachineId};

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of booking and machine events, per machine and as a single firehose.
pub struct NotifyHub {
    channels: DashMap<MachineId, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to events for one machine. Creates the channel if needed.
    pub fn subscribe(&self, machine_id: MachineId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(machine_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every event on every machine.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, machine_id: MachineId, event: &Event) {
        if let Some(sender) = self.channels.get(&machine_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop a machine's channel once its last subscriber has gone.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

/// JSON payload for an event, as handed to external listeners.
pub fn payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

/// Log every event from the firehose until the hub is dropped.
pub async fn log_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => debug!(machine = %event.machine_id(), "event {}", payload(&event)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("event log lagged, skipped {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
