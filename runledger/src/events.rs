use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, JobKind, JobStatus};

/// Metadata envelope attached to every ledger event.
///
/// Events published for the same commit share a `correlation_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            version: 1,
            correlation_id,
            timestamp: Utc::now(),
        }
    }
}

/// A committed change to the ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub meta: EventMeta,
    pub payload: LedgerEventPayload,
}

impl LedgerEvent {
    /// An event with a correlation id of its own.
    pub fn new(payload: LedgerEventPayload) -> Self {
        Self::correlated(Uuid::now_v7(), payload)
    }

    pub fn correlated(correlation_id: Uuid, payload: LedgerEventPayload) -> Self {
        Self {
            meta: EventMeta::new(correlation_id),
            payload,
        }
    }

    /// The job this event concerns, if it concerns a single job.
    pub fn job_id(&self) -> Option<&JobId> {
        match &self.payload {
            LedgerEventPayload::Created { job_id, .. }
            | LedgerEventPayload::StatusChanged { job_id, .. }
            | LedgerEventPayload::Progress { job_id, .. }
            | LedgerEventPayload::OutputRecorded { job_id, .. }
            | LedgerEventPayload::Finished { job_id, .. } => Some(job_id),
            LedgerEventPayload::Purged { .. } | LedgerEventPayload::Cancelled { .. } => None,
        }
    }
}

/// Event payloads, published only after the owning transaction commits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LedgerEventPayload {
    Created {
        job_id: JobId,
        kind: JobKind,
    },
    /// Non-terminal status change.
    StatusChanged {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    Progress {
        job_id: JobId,
        current_step: i64,
        total_steps: Option<i64>,
    },
    OutputRecorded {
        job_id: JobId,
        output_path: String,
    },
    /// The job reached DONE, FAILED or CANCELLED.
    Finished {
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
        output_path: Option<String>,
    },
    /// Bulk cancellation by an interrupt drain.
    Cancelled {
        job_ids: Vec<JobId>,
        reason: String,
    },
    Purged {
        count: u64,
    },
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Multiple subscribers each receive every event (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process fan-out of ledger events.
///
/// Publishing never waits on subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and resumes from the
/// oldest retained event.
pub struct LedgerEventBus {
    sender: broadcast::Sender<LedgerEvent>,
    capacity: usize,
}

impl std::fmt::Debug for LedgerEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for LedgerEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LedgerEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Broadcast an event. Dropped silently when nobody is listening.
    pub fn emit(&self, payload: LedgerEventPayload) {
        self.send(LedgerEvent::new(payload));
    }

    /// Broadcast an event tied to the other events of one commit.
    pub fn emit_correlated(&self, correlation_id: Uuid, payload: LedgerEventPayload) {
        self.send(LedgerEvent::correlated(correlation_id, payload));
    }

    fn send(&self, event: LedgerEvent) {
        let _ = self.sender.send(event);
    }
}

impl EventSubscriber<LedgerEvent> for LedgerEventBus {
    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn finished(id: &str) -> LedgerEventPayload {
        LedgerEventPayload::Finished {
            job_id: JobId::parse(id).unwrap(),
            status: JobStatus::Done,
            error_message: None,
            output_path: Some("/out/model.safetensors".into()),
        }
    }

    #[tokio::test]
    async fn test_broadcast_to_multiple_subscribers() {
        let bus = LedgerEventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        for i in 0..3 {
            bus.emit(finished(&format!("job{i}")));
        }

        for i in 0..3 {
            let a = timeout(Duration::from_millis(100), rx1.recv())
                .await
                .unwrap()
                .unwrap();
            let b = timeout(Duration::from_millis(100), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(a.job_id().unwrap().as_str(), format!("job{i}"));
            assert_eq!(b.job_id().unwrap().as_str(), format!("job{i}"));
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = LedgerEventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.emit(finished(&format!("job{i}")));
        }

        match timeout(Duration::from_millis(100), rx.recv()).await.unwrap() {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_correlated_events_share_an_id() {
        let bus = LedgerEventBus::default();
        let mut rx = bus.subscribe();

        let commit = Uuid::now_v7();
        bus.emit_correlated(commit, finished("job-a"));
        bus.emit_correlated(commit, finished("job-b"));
        bus.emit(LedgerEventPayload::Purged { count: 2 });

        let ids: Vec<Uuid> = (0..3)
            .map(|_| rx.try_recv().unwrap().meta.correlation_id)
            .collect();
        assert_eq!(ids[0], commit);
        assert_eq!(ids[1], commit);
        assert_ne!(ids[2], commit);

        let debug_str = format!("{bus:?}");
        assert!(debug_str.contains("subscribers: 1"));
        assert!(debug_str.contains("capacity: 1024"));
    }

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let event = LedgerEvent::new(LedgerEventPayload::StatusChanged {
            job_id: JobId::parse("abc12345").unwrap(),
            from: JobStatus::Ready,
            to: JobStatus::Training,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "status_changed");
        assert_eq!(json["payload"]["to"], "TRAINING");
        assert_eq!(json["meta"]["version"], 1);
    }
}
