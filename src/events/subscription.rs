//! Subscriber side of the bus: an ordered, de-duplicated event stream.

use std::collections::{BTreeSet, VecDeque};

use futures::Stream;
use tokio::sync::mpsc;

use super::{Channel, Event};

/// Ids remembered per subscription before the window slides forward.
const DEDUP_WINDOW: usize = 1024;

/// Remembers recently seen ids. Anything at or below `floor` counts as seen.
#[derive(Debug, Default)]
struct SeenIds {
    floor: u64,
    ids: BTreeSet<u64>,
}

impl SeenIds {
    fn starting_after(floor: u64) -> Self {
        Self {
            floor,
            ids: BTreeSet::new(),
        }
    }

    /// Returns `true` the first time an id is observed.
    fn insert(&mut self, id: u64) -> bool {
        if id <= self.floor || !self.ids.insert(id) {
            return false;
        }
        while self.ids.len() > DEDUP_WINDOW {
            if let Some(oldest) = self.ids.pop_first() {
                self.floor = oldest;
            }
        }
        true
    }

    fn highest(&self) -> u64 {
        self.ids.last().copied().unwrap_or(self.floor)
    }
}

/// Events for one channel.
///
/// Delivery upstream is at-least-once (the local fast path and the change-log
/// poller can both hand over the same event); ids already seen are skipped.
#[derive(Debug)]
pub struct Subscription {
    channel: Channel,
    rx: mpsc::Receiver<Event>,
    backlog: VecDeque<Event>,
    seen: SeenIds,
}

impl Subscription {
    pub(crate) fn new(channel: Channel, rx: mpsc::Receiver<Event>, after_id: u64, backlog: Vec<Event>) -> Self {
        Self {
            channel,
            rx,
            backlog: backlog.into(),
            seen: SeenIds::starting_after(after_id),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Highest event id handed out so far. Pass it to
    /// [`EventBus::subscribe_from`](super::EventBus::subscribe_from) after a reconnect.
    pub fn last_seen(&self) -> u64 {
        self.seen.highest()
    }

    /// Next unseen event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => self.rx.recv().await?,
            };
            if self.seen.insert(event.id) {
                return Some(event);
            }
        }
    }

    /// Next unseen event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => self.rx.try_recv().ok()?,
            };
            if self.seen.insert(event.id) {
                return Some(event);
            }
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        let mut subscription = self;
        async_stream::stream! {
            while let Some(event) = subscription.recv().await {
                yield event;
            }
        }
    }
}
