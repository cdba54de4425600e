//! Chat/transfer event queue consumed by an external presentation layer.
//!
//! A fixed-capacity, lossy, single-consumer ring: when full, the oldest
//! entry is dropped to make room so producers (the receive loop, the
//! transfer engine) never block. Grounded on the original `client.c` event
//! ring (`eq_head`/`eq_tail` indices into a fixed array); this rewrite
//! owns the ring as a `VecDeque` behind a `parking_lot::Mutex` instead of a
//! pair of raw indices, matching the "process-wide singleton -> explicit
//! state" redesign note: the queue is an owned value, not a module static.

use std::collections::VecDeque;

use parking_lot::Mutex;

pub const EVENT_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub enum ChatEvent {
    Chat {
        from: String,
        text: String,
        timestamp_ms: i64,
    },
    FileProgress {
        xfer_id: u32,
        done: u32,
        total: u32,
    },
    FileComplete {
        xfer_id: u32,
        filename: String,
    },
    FileError {
        xfer_id: u32,
        message: String,
    },
}

pub struct EventQueue {
    inner: Mutex<VecDeque<ChatEvent>>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push an event, dropping the oldest if the ring is at capacity.
    pub fn push(&self, event: ChatEvent) {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(event);
    }

    /// Pop the oldest pending event, if any.
    pub fn poll(&self) -> Option<ChatEvent> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(EVENT_QUEUE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let q = EventQueue::new(4);
        for i in 0..3 {
            q.push(ChatEvent::FileProgress { xfer_id: i, done: 0, total: 1 });
        }
        match q.poll().unwrap() {
            ChatEvent::FileProgress { xfer_id, .. } => assert_eq!(xfer_id, 0),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = EventQueue::new(2);
        q.push(ChatEvent::FileProgress { xfer_id: 1, done: 0, total: 1 });
        q.push(ChatEvent::FileProgress { xfer_id: 2, done: 0, total: 1 });
        q.push(ChatEvent::FileProgress { xfer_id: 3, done: 0, total: 1 });

        assert_eq!(q.len(), 2);
        match q.poll().unwrap() {
            ChatEvent::FileProgress { xfer_id, .. } => assert_eq!(xfer_id, 2),
            _ => panic!("wrong variant"),
        }
        match q.poll().unwrap() {
            ChatEvent::FileProgress { xfer_id, .. } => assert_eq!(xfer_id, 3),
            _ => panic!("wrong variant"),
        }
        assert!(q.poll().is_none());
    }
}
