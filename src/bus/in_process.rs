use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{BusError, MessageBus};
use crate::models::event::{Channel, Envelope, Event};

struct Topic {
    tx: broadcast::Sender<Envelope>,
    next_sequence: u64,
}

pub struct InProcessBus {
    topics: DashMap<Channel, Topic>,
    buffer_size: usize,
}

impl InProcessBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            topics: DashMap::new(),
            buffer_size: buffer_size.max(1),
        }
    }

    // booking topics are per delivery; once nobody listens they are dead weight
    fn prune_bookings(&self) {
        self.topics.retain(|channel, topic| {
            !matches!(channel, Channel::Booking(_)) || topic.tx.receiver_count() > 0
        });
    }

    fn new_topic(&self) -> Topic {
        let (tx, _unused_rx) = broadcast::channel(self.buffer_size);
        Topic {
            tx,
            next_sequence: 1,
        }
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, channel: Channel, event: &Event) -> Result<Envelope, BusError> {
        // The entry guard is held across sequence assignment and send, which
        // keeps per-channel ordering intact under concurrent publishers.
        let mut topic = self
            .topics
            .entry(channel)
            .or_insert_with(|| self.new_topic());

        let envelope = Envelope {
            event_id: Uuid::new_v4(),
            channel,
            sequence: topic.next_sequence,
            published_at: Utc::now(),
            event: event.clone(),
        };
        topic.next_sequence += 1;

        let delivered = topic.tx.send(envelope.clone()).is_ok();
        drop(topic);

        if !delivered {
            debug!(channel = %channel, event = event.kind(), "no live subscribers");
            if matches!(channel, Channel::Booking(_)) {
                self.topics
                    .remove_if(&channel, |_, topic| topic.tx.receiver_count() == 0);
            }
        }

        Ok(envelope)
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Envelope> {
        self.prune_bookings();
        self.topics
            .entry(channel)
            .or_insert_with(|| self.new_topic())
            .tx
            .subscribe()
    }
}
