//! Per-run event rooms.
//!
//! One `tokio::sync::broadcast` channel per run, held in an explicit
//! registry rather than a module-level map. Lifecycle: a room is created
//! lazily by the first [`RoomRegistry::subscribe`], and dropped by the
//! first [`RoomRegistry::publish`] that finds no receivers left.
//!
//! Delivery is at-most-once per connected subscriber with no persistence:
//! a disconnected client catches up from the run-state history endpoint,
//! not from replay here. Publishing never blocks -- a slow subscriber
//! lags and drops events, it cannot stall the state machine's commit.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

/// Events fanned out to a run's room. The serde tags are the wire event
/// names clients subscribe to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum RunEvent {
    #[serde(rename = "coordination.state.changed")]
    StateChanged {
        run_id: String,
        from: String,
        to: String,
        completed: bool,
    },
    #[serde(rename = "coordination.participant.added")]
    ParticipantAdded {
        run_id: String,
        participant_id: String,
        role: String,
    },
    #[serde(rename = "coordination.participant.removed")]
    ParticipantRemoved {
        run_id: String,
        participant_id: String,
    },
    #[serde(rename = "facilitator:message")]
    Message {
        run_id: String,
        from_participant: String,
        body: String,
    },
}

/// Buffered events per room before slow subscribers start lagging.
const ROOM_CAPACITY: usize = 256;

/// Registry of live rooms, keyed by run id.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, broadcast::Sender<RunEvent>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a run's room, creating it if needed.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunEvent> {
        let mut rooms = self.lock();
        rooms
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Fire-and-forget publish to a run's room. A room whose last
    /// subscriber is gone is removed here.
    pub fn publish(&self, run_id: &str, event: RunEvent) {
        let mut rooms = self.lock();
        if let Some(tx) = rooms.get(run_id) {
            if tx.send(event).is_err() {
                rooms.remove(run_id);
            }
        }
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<RunEvent>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }
}
