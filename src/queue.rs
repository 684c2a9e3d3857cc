//! Send-task queue
//!
//! FIFO of task ids awaiting an RPA worker. The queue is advisory: the Store
//! is authoritative, and the reconciliation scan re-pushes anything lost
//! here. Payloads are task ids only; workers fetch the send payload from the
//! Store.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// FIFO of pending send-task ids.
///
/// `push` is idempotent: a task id already enqueued is not duplicated, so the
/// reconciliation scan can re-push without inflating the queue. `pop` never
/// blocks; an empty queue returns `None` and the worker retries on its own
/// schedule.
pub trait TaskQueue: Send + Sync {
    fn push(&self, task_id: i64);
    fn pop(&self) -> Option<i64>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process queue backing a single broker instance.
#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    order: VecDeque<i64>,
    members: HashSet<i64>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for InMemoryQueue {
    fn push(&self, task_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.members.insert(task_id) {
            inner.order.push_back(task_id);
        }
    }

    fn pop(&self) -> Option<i64> {
        let mut inner = self.inner.lock().unwrap();
        let task_id = inner.order.pop_front()?;
        inner.members.remove(&task_id);
        Some(task_id)
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = InMemoryQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_push_is_idempotent() {
        let q = InMemoryQueue::new();
        q.push(7);
        q.push(7);
        q.push(7);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.pop(), None);

        // Once popped, the id may be enqueued again (retry path).
        q.push(7);
        assert_eq!(q.pop(), Some(7));
    }

    #[test]
    fn test_pop_never_blocks_on_empty() {
        let q = InMemoryQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }
}
