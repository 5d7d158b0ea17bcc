//! Process-wide event bus with per-run monotonic sequence numbers.
//!
//! Every emission is stamped `{run_id, seq, ts, stream, data}`; subscribers
//! fan out synchronously and their panics are swallowed. A lifecycle event
//! with phase `end` or `error` releases the run's sequence counter.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

/// Logical stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    Lifecycle,
    Assistant,
    Tool,
    Subagent,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    pub run_id: String,
    /// Monotonic within a run, starting at 1.
    pub seq: u64,
    pub ts_ms: i64,
    pub stream: EventStream,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub data: Value,
}

type Subscriber = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    seqs: HashMap<String, u64>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn emit(
        &self,
        run_id: &str,
        stream: EventStream,
        session_key: Option<&str>,
        agent_id: Option<&str>,
        data: Value,
    ) {
        let (event, subscribers) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let seq = inner.seqs.entry(run_id.to_string()).or_insert(0);
            *seq += 1;
            let event = AgentEvent {
                run_id: run_id.to_string(),
                seq: *seq,
                ts_ms: Utc::now().timestamp_millis(),
                stream,
                session_key: session_key.map(str::to_string),
                agent_id: agent_id.map(str::to_string),
                data,
            };

            let terminal = stream == EventStream::Lifecycle
                && matches!(
                    event.data.get("phase").and_then(|p| p.as_str()),
                    Some("end") | Some("error")
                );
            if terminal {
                inner.seqs.remove(run_id);
            }

            let subscribers: Vec<Subscriber> = inner.subscribers.values().cloned().collect();
            (event, subscribers)
        };

        for subscriber in subscribers {
            let _ = catch_unwind(AssertUnwindSafe(|| subscriber(&event)));
        }
    }

    /// Attach a subscriber; dropping the returned guard unsubscribes.
    #[allow(dead_code)]
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&AgentEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.insert(id, Arc::new(callback));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }
}

/// Disposer handle for a subscription.
#[allow(dead_code)]
pub struct Subscription {
    bus: std::sync::Weak<EventBus>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut inner = bus.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.remove(&self.id);
        }
    }
}
