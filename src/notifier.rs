use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Refresh,
    Heartbeat,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn now(kind: ChangeKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }
}

pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

pub struct ChangeNotifier {
    subscribers: Mutex<Vec<(u64, mpsc::Sender<ChangeEvent>)>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(sub, _)| *sub != id);
    }

    pub fn publish(&self, kind: ChangeKind) -> usize {
        self.publish_event(ChangeEvent::now(kind))
    }

    pub fn publish_event(&self, event: ChangeEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(_, tx)| tx.try_send(event.clone()).is_ok());
        let delivered = subscribers.len();
        if delivered < before {
            debug!(
                dropped = before - delivered,
                kind = ?event.kind,
                "removed unreachable subscribers"
            );
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn spawn_heartbeat(self: &Arc<Self>, every: Duration) -> Heartbeat {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let notifier = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        notifier.publish(ChangeKind::Heartbeat);
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Heartbeat { stop: stop_tx, task }
    }
}

pub struct Heartbeat {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_type_tag_and_timestamp() {
        let value = serde_json::to_value(ChangeEvent::now(ChangeKind::Refresh)).expect("json");
        assert_eq!(value["type"], "refresh");
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn every_live_subscriber_receives_the_event() {
        let notifier = ChangeNotifier::default();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        assert_eq!(notifier.publish(ChangeKind::Refresh), 2);
        assert_eq!(a.recv().await.map(|e| e.kind), Some(ChangeKind::Refresh));
        assert_eq!(b.recv().await.map(|e| e.kind), Some(ChangeKind::Refresh));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_removed_without_affecting_others() {
        let notifier = ChangeNotifier::default();
        let gone = notifier.subscribe();
        let mut kept = notifier.subscribe();
        drop(gone);

        assert_eq!(notifier.publish(ChangeKind::Refresh), 1);
        assert_eq!(notifier.subscriber_count(), 1);
        assert!(kept.try_recv().is_some());
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped() {
        let notifier = ChangeNotifier::new(1);
        let mut slow = notifier.subscribe();
        assert_eq!(notifier.publish(ChangeKind::Refresh), 1);
        assert_eq!(notifier.publish(ChangeKind::Refresh), 0);
        assert_eq!(notifier.subscriber_count(), 0);
        assert!(slow.try_recv().is_some());
    }

    #[tokio::test]
    async fn unsubscribe_removes_by_id() {
        let notifier = ChangeNotifier::default();
        let sub = notifier.subscribe();
        notifier.unsubscribe(sub.id());
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ticks_until_stopped() {
        let notifier = Arc::new(ChangeNotifier::default());
        let mut sub = notifier.subscribe();
        let heartbeat = notifier.spawn_heartbeat(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(61)).await;
        heartbeat.stop().await;

        let mut beats = 0;
        while let Some(event) = sub.try_recv() {
            assert_eq!(event.kind, ChangeKind::Heartbeat);
            beats += 1;
        }
        assert_eq!(beats, 2);
    }
}
