//! Publisher side of the bus.
//!
//! `publish` appends to the change log (which assigns the id) and hands the
//! event straight to local subscribers. A poller reads the log on a fixed
//! interval and redelivers events that other bus instances (sibling
//! processes sharing the store) appended. Each subscriber has its own
//! bounded queue; a slow subscriber loses events rather than stalling the
//! publisher, and can resynchronise with [`EventBus::subscribe_from`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Channel, Event, EventKind, NewEvent, Subscription};
use crate::config::EventsConfig;
use crate::error::Result;
use crate::store::ChangeLog;

type Subscribers = HashMap<Channel, Vec<mpsc::Sender<Event>>>;

pub struct EventBus {
    instance_id: Uuid,
    log: Arc<dyn ChangeLog>,
    subscribers: Mutex<Subscribers>,
    /// Serializes append + local delivery so local subscribers see ids in order.
    publish_lock: tokio::sync::Mutex<()>,
    /// Highest change-log id this instance has scanned.
    cursor: AtomicU64,
    config: EventsConfig,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("instance_id", &self.instance_id)
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus over `log`. History already in the log is not redelivered.
    pub async fn new(log: Arc<dyn ChangeLog>, config: EventsConfig) -> Result<Self> {
        let cursor = log.latest_id().await?;
        Ok(Self {
            instance_id: Uuid::new_v4(),
            log,
            subscribers: Mutex::new(HashMap::new()),
            publish_lock: tokio::sync::Mutex::new(()),
            cursor: AtomicU64::new(cursor),
            config,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to live events on `channel`.
    pub fn subscribe(&self, channel: Channel) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        self.subscribers().entry(channel.clone()).or_default().push(tx);
        Subscription::new(channel, rx, 0, Vec::new())
    }

    /// Subscribe and replay everything on `channel` after `after_id` from the
    /// change log. Used after a reconnect; events the client already saw are
    /// not handed out again.
    pub async fn subscribe_from(&self, channel: Channel, after_id: u64) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        self.subscribers().entry(channel.clone()).or_default().push(tx);

        let mut backlog = Vec::new();
        let mut cursor = after_id;
        loop {
            let page = self.log.read_after(cursor, self.config.poll_batch).await?;
            let Some(last) = page.last() else { break };
            cursor = last.id;
            let full_page = page.len() >= self.config.poll_batch;
            backlog.extend(page.into_iter().filter(|e| e.channel == channel));
            if !full_page {
                break;
            }
        }
        Ok(Subscription::new(channel, rx, after_id, backlog))
    }

    /// Live subscribers on `channel` in this process.
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.subscribers()
            .get(channel)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Append to the change log and deliver to local subscribers.
    pub async fn publish(
        &self,
        channel: Channel,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let _guard = self.publish_lock.lock().await;
        let event = self
            .log
            .append(NewEvent {
                channel,
                kind,
                payload,
                origin: self.instance_id,
            })
            .await?;
        self.deliver(&event);
        Ok(event)
    }

    fn deliver(&self, event: &Event) {
        let mut subscribers = self.subscribers();
        let Some(senders) = subscribers.get_mut(&event.channel) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    channel = %event.channel,
                    event_id = event.id,
                    "subscriber queue full; dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            subscribers.remove(&event.channel);
        }
    }

    /// Read new change-log entries once and redeliver those published by
    /// other instances. Returns how many were delivered.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let after = self.cursor.load(Ordering::Acquire);
            let page = self.log.read_after(after, self.config.poll_batch).await?;
            let Some(last_id) = page.last().map(|e| e.id) else {
                break;
            };
            let full_page = page.len() >= self.config.poll_batch;
            for event in page.iter().filter(|e| e.origin != self.instance_id) {
                self.deliver(event);
                delivered += 1;
            }
            self.cursor.fetch_max(last_id, Ordering::AcqRel);
            if !full_page {
                break;
            }
        }
        if delivered > 0 {
            tracing::debug!(delivered, "redelivered change-log events");
        }
        Ok(delivered)
    }

    /// Poll the change log every `poll_interval` until `shutdown` fires.
    pub fn spawn_poller(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bus.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = bus.poll_once().await {
                            tracing::warn!(error = %e, "change-log poll failed");
                        }
                    }
                }
            }
            tracing::debug!(instance = %bus.instance_id, "change-log poller stopped");
        })
    }
}
