// src/motion/queue.rs - Bounded FIFO between the control loop and the PLC task
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::MotionPrimitive;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Motion queue full ({free} free, {needed} needed)")]
pub struct QueueFull {
    pub free: usize,
    pub needed: usize,
}

/// Primitive waiting for, or being carried out by, the PLC.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPrimitive {
    pub seq: u64,
    /// Recipe line index that produced it; `None` for manual and calibration moves.
    pub line: Option<usize>,
    pub primitive: MotionPrimitive,
}

/// Statistics for the motion queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub length: usize,
    pub capacity: usize,
    pub submitted: u64,
    pub completed: u64,
    pub last_completed: Option<String>,
}

#[derive(Debug)]
struct QueueInner {
    entries: VecDeque<QueuedPrimitive>,
    capacity: usize,
    next_seq: u64,
    completed: u64,
    last_completed: Option<String>,
    consumer_ready: bool,
}

/// Shared handle; the control loop pushes, the PLC task peeks and completes.
///
/// Entries leave strictly in the order they were pushed.
#[derive(Debug, Clone)]
pub struct MotionQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl MotionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                entries: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                next_seq: 0,
                completed: 0,
                last_completed: None,
                consumer_ready: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn free(&self) -> usize {
        let inner = self.lock();
        inner.capacity - inner.entries.len()
    }

    /// Push every primitive or none of them.
    pub fn try_push_all(&self, line: Option<usize>, primitives: Vec<MotionPrimitive>) -> Result<(), QueueFull> {
        let mut inner = self.lock();
        let free = inner.capacity - inner.entries.len();
        if primitives.len() > free {
            return Err(QueueFull { free, needed: primitives.len() });
        }
        for primitive in primitives {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.push_back(QueuedPrimitive { seq, line, primitive });
        }
        Ok(())
    }

    pub fn push(&self, line: Option<usize>, primitive: MotionPrimitive) -> Result<(), QueueFull> {
        self.try_push_all(line, vec![primitive])
    }

    /// Oldest entry, left in place until [`MotionQueue::complete`].
    pub fn front(&self) -> Option<QueuedPrimitive> {
        self.lock().entries.front().cloned()
    }

    /// Retire the front entry if it is `seq`. Returns false for any other entry.
    pub fn complete(&self, seq: u64) -> bool {
        let mut inner = self.lock();
        match inner.entries.front() {
            Some(front) if front.seq == seq => {
                let done = inner.entries.pop_front();
                inner.completed += 1;
                inner.last_completed = done.map(|entry| entry.primitive.to_string());
                true
            }
            _ => false,
        }
    }

    /// Drop everything still waiting, returning what was dropped in order.
    pub fn clear(&self) -> Vec<QueuedPrimitive> {
        self.lock().entries.drain(..).collect()
    }

    /// Recipe line of the oldest unfinished recipe primitive.
    pub fn oldest_pending_line(&self) -> Option<usize> {
        self.lock().entries.iter().find_map(|entry| entry.line)
    }

    pub fn set_consumer_ready(&self, ready: bool) {
        self.lock().consumer_ready = ready;
    }

    /// Whether the PLC side is currently accepting primitives.
    pub fn consumer_ready(&self) -> bool {
        self.lock().consumer_ready
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            length: inner.entries.len(),
            capacity: inner.capacity,
            submitted: inner.next_seq,
            completed: inner.completed,
            last_completed: inner.last_completed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dwell(ms: u64) -> MotionPrimitive {
        MotionPrimitive::Dwell { ms }
    }

    #[test]
    fn push_all_is_all_or_nothing() {
        let queue = MotionQueue::new(3);
        queue.try_push_all(Some(0), vec![dwell(1), dwell(2)]).unwrap();
        let err = queue.try_push_all(Some(1), vec![dwell(3), dwell(4)]).unwrap_err();
        assert_eq!(err, QueueFull { free: 1, needed: 2 });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn completes_in_fifo_order_only() {
        let queue = MotionQueue::new(4);
        queue.try_push_all(Some(0), vec![dwell(1), dwell(2)]).unwrap();
        let first = queue.front().unwrap();
        assert_eq!(first.primitive, dwell(1));
        assert!(!queue.complete(first.seq + 1));
        assert!(queue.complete(first.seq));
        assert_eq!(queue.front().unwrap().primitive, dwell(2));
        assert_eq!(queue.stats().completed, 1);
    }

    #[test]
    fn oldest_pending_line_skips_manual_entries() {
        let queue = MotionQueue::new(4);
        queue.push(None, dwell(1)).unwrap();
        queue.push(Some(7), dwell(2)).unwrap();
        queue.push(Some(8), dwell(3)).unwrap();
        assert_eq!(queue.oldest_pending_line(), Some(7));
        let dropped = queue.clear();
        assert_eq!(dropped.len(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.oldest_pending_line(), None);
    }
}
