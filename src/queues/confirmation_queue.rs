use std::sync::Arc;
use tokio::time::Instant;
use crate::packet::AckPacket;
use crate::queues::engine_queue::EngineQueue;
use crate::queues::wakeup::Wakeup;

pub struct Confirmation {
    pub ack: AckPacket,
    pub received_at: Instant,
}

/// Acks received by the receiver, waiting for the publisher to process them
pub struct ConfirmationQueue {
    queue: EngineQueue<Confirmation>,
}

impl ConfirmationQueue {
    pub fn new(publisher_wakeup: Arc<Wakeup>) -> ConfirmationQueue {
        ConfirmationQueue {
            queue: EngineQueue::new(publisher_wakeup),
        }
    }

    pub fn add(&self, ack: AckPacket, received_at: Instant) {
        self.queue.add(Confirmation { ack, received_at });
    }

    pub fn drain(&self) -> Vec<Confirmation> {
        self.queue.drain()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
