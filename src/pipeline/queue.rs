use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    terminated: bool,
}

/// Bounded multi-producer multi-consumer work queue: the sole synchronization
/// point between a node's producers and its workers.
///
/// Contract: `push` blocks while the queue is full and fails only once the
/// queue has been terminated; `pop` blocks while the queue is empty and
/// returns `None` only when the queue is empty *and* terminated, so queued
/// messages always drain before workers exit. FIFO per producer; interleaving
/// between producers is unspecified.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        WorkQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                terminated: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues an item, blocking while the queue is full. Returns the item
    /// back to the caller when the queue has been terminated.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        while state.items.len() >= self.capacity && !state.terminated {
            state = self.not_full.wait(state).unwrap();
        }
        if state.terminated {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues an item, blocking while the queue is empty and live. `None`
    /// means the queue is terminated and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        while state.items.is_empty() && !state.terminated {
            state = self.not_empty.wait(state).unwrap();
        }
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Closes the queue: future pushes fail, pops drain the remaining items.
    pub fn terminate(&self) {
        let mut state = self.state.lock().unwrap();
        state.terminated = true;
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_single_producer() {
        let queue = WorkQueue::new(10);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        queue.terminate();
        let drained: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_push_fails_after_terminate() {
        let queue = WorkQueue::new(4);
        queue.push(1).unwrap();
        queue.terminate();
        assert_eq!(queue.push(2), Err(2));
        // The queued item still drains.
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_push_blocks_until_consumed() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.push(0u32).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1).is_ok())
        };
        // Give the producer time to block on the full queue.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.pop(), Some(0));
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn test_pop_blocks_until_terminated() {
        let queue = Arc::new(WorkQueue::<u32>::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.terminate();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_many_producers_many_consumers() {
        let queue = Arc::new(WorkQueue::new(16));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.push(p * 100 + i).unwrap();
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(item) = queue.pop() {
                        seen.push(item);
                    }
                    seen
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        queue.terminate();
        let mut all: Vec<i32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..400).collect::<Vec<i32>>());
    }
}
