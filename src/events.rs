use log::warn;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::GpioError;
use crate::gpio::{Line, Listener, WatchPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEvent {
    pub line: u32,
    pub value: u8,
    pub timestamp_ms: u64,
}

/// Fans line events out to broadcast subscribers and keeps a bounded history
/// per line.
pub struct EventBus {
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: FxHashMap<u32, RwLock<VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new<I>(lines: I, broadcast_capacity: usize, event_history_capacity: usize) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let (event_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        let event_history = lines
            .into_iter()
            .map(|id| (id, RwLock::new(VecDeque::new())))
            .collect();

        Self {
            event_tx,
            event_history,
            event_history_capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        if let Some(history_lock) = self.event_history.get(&event.line) {
            let mut history = history_lock.write();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // no subscribers is not an error
        let _ = self.event_tx.send(event);
    }

    /// A watch callback that records every value seen on `line`.
    pub fn listener(self: &Arc<Self>, line: u32) -> Listener {
        let bus = Arc::clone(self);
        Arc::new(move |result: Result<u8, GpioError>| match result {
            Ok(value) => bus.dispatch(EdgeEvent {
                line,
                value,
                timestamp_ms: epoch_millis(),
            }),
            Err(e) => warn!("gpio{line} watch error: {e}"),
        })
    }

    /// Reports every edge on `line` to the bus until [`EventBus::close`].
    ///
    /// A one-shot line drops its listeners after each delivery, so it is
    /// watched again from inside the callback.
    pub fn watch(self: &Arc<Self>, line: &Arc<Line>) -> Result<(), GpioError> {
        let record = self.listener(line.id());
        if line.policy() != WatchPolicy::OneShot {
            return line.watch(record);
        }

        let bus = Arc::clone(self);
        let weak = Arc::downgrade(line);
        line.watch(Arc::new(move |result: Result<u8, GpioError>| {
            record(result);
            let Some(line) = weak.upgrade() else {
                return;
            };
            // a poller error leaves the registration in place
            if bus.is_closed() || line.listener_count() > 0 {
                return;
            }
            if let Err(e) = bus.watch(&line) {
                warn!("gpio{} re-watch: {e}", line.id());
            }
        }))
    }

    /// Stops [`EventBus::watch`] from re-arming one-shot lines.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_tx.subscribe()
    }

    /// Up to `limit` most recent events for `line`, oldest first.
    pub fn events(&self, line: u32, limit: Option<usize>) -> Vec<EdgeEvent> {
        self.event_history
            .get(&line)
            .map(|d| {
                let history = d.read();
                let skip = limit.map_or(0, |lim| history.len().saturating_sub(lim));
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn last_event(&self, line: u32) -> Option<EdgeEvent> {
        self.event_history
            .get(&line)
            .and_then(|d| d.read().back().cloned())
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: u32, value: u8, timestamp_ms: u64) -> EdgeEvent {
        EdgeEvent {
            line,
            value,
            timestamp_ms,
        }
    }

    #[test]
    fn history_is_bounded_per_line() {
        let bus = EventBus::new([1, 2], 8, 2);
        bus.dispatch(event(1, 1, 10));
        bus.dispatch(event(1, 0, 20));
        bus.dispatch(event(1, 1, 30));
        bus.dispatch(event(2, 1, 40));

        assert_eq!(bus.events(1, None), vec![event(1, 0, 20), event(1, 1, 30)]);
        assert_eq!(bus.events(1, Some(1)), vec![event(1, 1, 30)]);
        assert_eq!(bus.last_event(2), Some(event(2, 1, 40)));
        assert_eq!(bus.last_event(3), None);
        assert!(bus.events(3, None).is_empty());
    }

    #[test]
    fn listener_feeds_subscribers() {
        let bus = Arc::new(EventBus::new([5], 8, 4));
        let mut rx = bus.subscribe();
        let listener = bus.listener(5);

        listener(Ok(1));
        listener(Err(GpioError::Poller("boom".into())));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.line, 5);
        assert_eq!(received.value, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.events(5, None).len(), 1);
    }
}
