use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use crate::queues::wakeup::Wakeup;

/// A FIFO of work items for an engine, signalling the engine's wakeup when items are added
pub struct EngineQueue<T> {
    items: Mutex<VecDeque<T>>,
    wakeup: Arc<Wakeup>,
}

impl<T> EngineQueue<T> {
    pub fn new(wakeup: Arc<Wakeup>) -> EngineQueue<T> {
        EngineQueue {
            items: Mutex::new(VecDeque::new()),
            wakeup,
        }
    }

    pub fn wakeup(&self) -> &Arc<Wakeup> {
        &self.wakeup
    }

    pub fn add(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.wakeup.signal();
    }

    pub fn add_all(&self, items: impl IntoIterator<Item = T>) {
        self.items.lock().unwrap().extend(items);
        self.wakeup.signal();
    }

    pub fn poll(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn drain(&self) -> Vec<T> {
        self.items.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_and_signal() {
        let queue = EngineQueue::new(Arc::new(Wakeup::new()));
        assert!(queue.poll().is_none());

        queue.add(1);
        queue.add_all([2, 3]);
        assert_eq!(queue.len(), 3);
        assert!(queue.wakeup().wait_until(None).await);

        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.drain(), vec![2, 3]);
        assert!(queue.is_empty());
    }
}
