use crate::catalog::CatalogRecord;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Cancelled,
    Error,
    Finished,
}

impl PipelineStatus {
    pub fn is_active(self) -> bool {
        matches!(self, PipelineStatus::Queued | PipelineStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Cancelled | PipelineStatus::Error | PipelineStatus::Finished
        )
    }
}

/// Everything an observer can learn about the current or last run.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineState {
    pub run_id: Option<Uuid>,
    pub status: PipelineStatus,
    pub progress: usize,
    pub total: usize,
    pub logs: Vec<String>,
    pub results: IndexMap<String, Vec<String>>,
    pub cancelled: bool,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub status: PipelineStatus,
    pub progress: usize,
    pub total: usize,
}

/// One entry of the observer feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    Log(String),
    Status(StatusUpdate),
    Results(Vec<CatalogRecord>),
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Log(_) => "log",
            PipelineEvent::Status(_) => "status",
            PipelineEvent::Results(_) => "results",
        }
    }

    /// SSE `data:` payload. Log lines go out as plain text with carriage
    /// returns stripped; the other events are JSON.
    pub fn data(&self) -> String {
        match self {
            PipelineEvent::Log(line) => line.replace('\r', ""),
            PipelineEvent::Status(update) => {
                serde_json::to_string(update).unwrap_or_else(|_| "{}".to_string())
            }
            PipelineEvent::Results(records) => {
                serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }
}

pub struct Subscription {
    pub id: u64,
    /// Every event of the current run emitted before subscribing.
    pub replay: Vec<PipelineEvent>,
    pub receiver: mpsc::UnboundedReceiver<PipelineEvent>,
}

/// Replayable fan-out of pipeline events. Each subscriber owns an unbounded
/// queue, so a slow reader never holds up the publisher.
#[derive(Default)]
pub struct EventBus {
    history: Vec<PipelineEvent>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<PipelineEvent>>,
    next_id: u64,
}

impl EventBus {
    pub fn subscribe(&mut self) -> Subscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, tx);
        Subscription {
            id,
            replay: self.history.clone(),
            receiver,
        }
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        self.subscribers
            .retain(|_, subscriber| subscriber.send(event.clone()).is_ok());
        self.history.push(event);
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_subscriber_gets_replay_before_live_events() {
        let mut bus = EventBus::default();
        bus.publish(PipelineEvent::Log("one".into()));
        bus.publish(PipelineEvent::Log("two".into()));
        bus.publish(PipelineEvent::Log("three".into()));

        let mut sub = bus.subscribe();
        bus.publish(PipelineEvent::Log("four".into()));

        let replayed: Vec<String> = sub.replay.iter().map(PipelineEvent::data).collect();
        assert_eq!(replayed, vec!["one", "two", "three"]);
        assert_eq!(sub.receiver.try_recv().unwrap(), PipelineEvent::Log("four".into()));
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_and_dropped_receivers_are_harmless() {
        let mut bus = EventBus::default();
        let first = bus.subscribe();
        let second = bus.subscribe();
        assert!(bus.unsubscribe(first.id));
        assert!(!bus.unsubscribe(first.id));
        drop(second);
        bus.publish(PipelineEvent::Log("still fine".into()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_payloads() {
        let status = PipelineEvent::Status(StatusUpdate {
            status: PipelineStatus::Running,
            progress: 2,
            total: 5,
        });
        assert_eq!(status.name(), "status");
        assert_eq!(
            status.data(),
            r#"{"status":"running","progress":2,"total":5}"#
        );
        assert_eq!(PipelineEvent::Log("a\r".into()).data(), "a");
        let results = PipelineEvent::Results(vec![CatalogRecord::new("A").with_images(["u"])]);
        assert_eq!(results.data(), r#"[{"sku":"A","images":["u"]}]"#);
    }

    #[test]
    fn terminal_statuses_are_not_active() {
        assert!(PipelineStatus::Running.is_active());
        assert!(!PipelineStatus::Finished.is_active());
        assert!(PipelineStatus::Cancelled.is_terminal());
        assert!(!PipelineStatus::Idle.is_terminal());
    }
}
