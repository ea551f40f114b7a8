//! Per-thread event fan-out with durable resume.
//!
//! [`EventHub::publish`] is the single entry point for a thread's event
//! stream: it appends the line to the thread's log, assigns the next event
//! id, and delivers the `(id, line)` pair to every live subscriber. All of
//! that happens under one per-thread async mutex — the "publish chain" —
//! so ids are contiguous from 1, every subscriber sees the same pairs in
//! the same order, and the id always equals the line's 1-based position in
//! the file.
//!
//! [`EventHub::subscribe`] joins under the same chain lock: it replays the
//! log tail after the caller's `Last-Event-ID` synchronously, then adds
//! the subscriber to the live set. Holding the lock across both steps is
//! what makes resume gapless and duplicate-free.
//!
//! Independent threads publish concurrently; only same-thread publishes
//! serialize. A publish that fails (append error) leaves the counter
//! untouched and the chain usable for subsequent events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use darkhold_core::event_log::{EventLogError, ThreadEventLog};

/// Buffered events per subscriber. A subscriber that falls this far behind
/// is treated as dead and removed, rather than stalling the thread's chain.
pub const SUBSCRIBER_BUFFER: usize = 1024;

/// One `(event id, raw line)` pair as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// 1-based position of the line in the thread's log.
    pub id: u64,
    /// The event line exactly as appended.
    pub data: String,
}

#[derive(Debug)]
struct ThreadHub {
    /// The publish chain. Holds the next event id; `None` until it has
    /// been derived from the file (entries + 1).
    chain: Mutex<Option<u64>>,
    subscribers: StdMutex<HashMap<Uuid, mpsc::Sender<StreamEvent>>>,
}

impl ThreadHub {
    fn new() -> Self {
        Self {
            chain: Mutex::new(None),
            subscribers: StdMutex::new(HashMap::new()),
        }
    }
}

/// The per-thread subscriber registry and publish serializer.
#[derive(Debug)]
pub struct EventHub {
    log: Arc<ThreadEventLog>,
    threads: StdMutex<HashMap<String, Arc<ThreadHub>>>,
}

impl EventHub {
    /// Create a hub backed by `log`.
    pub fn new(log: Arc<ThreadEventLog>) -> Self {
        Self {
            log,
            threads: StdMutex::new(HashMap::new()),
        }
    }

    /// The backing log store.
    pub fn log(&self) -> &Arc<ThreadEventLog> {
        &self.log
    }

    fn thread_hub(&self, thread_id: &str) -> Arc<ThreadHub> {
        let mut threads = self.threads.lock().expect("hub map mutex poisoned");
        Arc::clone(
            threads
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(ThreadHub::new())),
        )
    }

    /// Append `line` to the thread's log and deliver it to every live
    /// subscriber. Returns the assigned event id.
    ///
    /// # Errors
    ///
    /// Propagates the append failure; the chain stays intact and the next
    /// publish proceeds normally.
    pub async fn publish(&self, thread_id: &str, line: &str) -> Result<u64, EventLogError> {
        let hub = self.thread_hub(thread_id);
        let mut chain = hub.chain.lock().await;

        let id = match *chain {
            Some(next) => next,
            None => self.log.len(thread_id).await? + 1,
        };
        self.log.append(thread_id, line).await?;
        *chain = Some(id + 1);

        let event = StreamEvent {
            id,
            data: line.to_string(),
        };
        let mut dead = Vec::new();
        {
            let subscribers = hub.subscribers.lock().expect("subscriber mutex poisoned");
            for (sub_id, tx) in subscribers.iter() {
                if tx.try_send(event.clone()).is_err() {
                    dead.push(*sub_id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = hub.subscribers.lock().expect("subscriber mutex poisoned");
            for sub_id in dead {
                subscribers.remove(&sub_id);
                tracing::debug!(thread = thread_id, subscriber = %sub_id, "removed dead subscriber");
            }
        }
        Ok(id)
    }

    /// Join the thread's stream, replaying everything after
    /// `last_event_id` (or the whole log when absent) before any live
    /// event is delivered.
    ///
    /// # Errors
    ///
    /// Fails when the log cannot be read for replay.
    pub async fn subscribe(
        self: &Arc<Self>,
        thread_id: &str,
        last_event_id: Option<u64>,
    ) -> Result<Subscription, EventLogError> {
        let hub = self.thread_hub(thread_id);
        let mut chain = hub.chain.lock().await;

        let lines = self.log.read(thread_id).await?;
        if chain.is_none() {
            *chain = Some(lines.len() as u64 + 1);
        }

        let skip = last_event_id.unwrap_or(0) as usize;
        let replay: Vec<StreamEvent> = lines
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(idx, data)| StreamEvent {
                id: idx as u64 + 1,
                data,
            })
            .collect();

        // Capacity covers the whole replay so the sends below cannot fail.
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER.max(replay.len() + 64));
        for event in replay {
            let _ = tx.try_send(event);
        }

        let subscriber_id = Uuid::new_v4();
        hub.subscribers
            .lock()
            .expect("subscriber mutex poisoned")
            .insert(subscriber_id, tx);

        Ok(Subscription {
            hub: Arc::clone(self),
            thread_id: thread_id.to_string(),
            subscriber_id,
            rx,
        })
    }

    /// Replace the thread's log from a `thread/read` result and reset the
    /// event-id counter to match, atomically with respect to publishes.
    ///
    /// # Errors
    ///
    /// Fails when the log rewrite fails; the counter is left to be
    /// re-derived from the file on the next publish.
    pub async fn rehydrate(
        &self,
        thread_id: &str,
        result: &serde_json::Value,
    ) -> Result<Vec<String>, EventLogError> {
        let hub = self.thread_hub(thread_id);
        let mut chain = hub.chain.lock().await;
        match self.log.rehydrate_from_thread_read(thread_id, result).await {
            Ok(lines) => {
                *chain = Some(lines.len() as u64 + 1);
                Ok(lines)
            }
            Err(e) => {
                *chain = None;
                Err(e)
            }
        }
    }

    /// Current live subscriber count for a thread.
    pub fn subscriber_count(&self, thread_id: &str) -> usize {
        let threads = self.threads.lock().expect("hub map mutex poisoned");
        threads
            .get(thread_id)
            .map(|hub| {
                hub.subscribers
                    .lock()
                    .expect("subscriber mutex poisoned")
                    .len()
            })
            .unwrap_or(0)
    }

    /// Remove a subscriber and garbage-collect the thread entry when it is
    /// both empty and unreferenced by any in-flight publish.
    fn unsubscribe(&self, thread_id: &str, subscriber_id: Uuid) {
        let mut threads = self.threads.lock().expect("hub map mutex poisoned");
        // Strong count 1 means the map holds the only reference: no publish
        // or subscribe is mid-flight on this thread, so dropping the entry
        // cannot fork the chain. The map lock keeps it that way until we
        // are done.
        let remove = match threads.get(thread_id) {
            Some(hub) => {
                let mut subscribers =
                    hub.subscribers.lock().expect("subscriber mutex poisoned");
                subscribers.remove(&subscriber_id);
                let empty = subscribers.is_empty();
                drop(subscribers);
                empty && Arc::strong_count(hub) == 1
            }
            None => false,
        };
        if remove {
            threads.remove(thread_id);
        }
    }
}

/// A live membership in one thread's stream. Dropping it unsubscribes.
pub struct Subscription {
    hub: Arc<EventHub>,
    thread_id: String,
    subscriber_id: Uuid,
    rx: mpsc::Receiver<StreamEvent>,
}

impl Subscription {
    /// Receive the next event — replayed history first, then live events.
    /// `None` when the hub has dropped this subscriber.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.thread_id, self.subscriber_id);
    }
}
