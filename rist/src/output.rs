//! Delivery queues
//!
//! A queue hands items (data blocks, OOB blocks) to the application in one
//! of two modes: a bounded FIFO polled with a timeout, or a callback run on
//! the delivering thread. The FIFO drops its oldest item when full. An
//! optional notify handle gets one byte each time the FIFO goes from empty
//! to non-empty.

use crate::error::{Result, RistError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default FIFO capacity
pub const DEFAULT_FIFO_SIZE: usize = 1024;

struct Fifo<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
    dropped: u64,
}

pub(crate) struct DeliveryQueue<T> {
    name: &'static str,
    fifo: Mutex<Fifo<T>>,
    ready: Condvar,
    callback: RwLock<Option<Arc<dyn Fn(T) + Send + Sync>>>,
    notify: Mutex<Option<Box<dyn Write + Send>>>,
}

impl<T> DeliveryQueue<T> {
    pub(crate) fn new(name: &'static str, capacity: usize) -> Self {
        DeliveryQueue {
            name,
            fifo: Mutex::new(Fifo {
                items: VecDeque::new(),
                capacity,
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
            callback: RwLock::new(None),
            notify: Mutex::new(None),
        }
    }

    /// Switch to callback delivery
    pub(crate) fn set_callback(&self, callback: Arc<dyn Fn(T) + Send + Sync>) {
        *self.callback.write() = Some(callback);
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback.read().is_some()
    }

    pub(crate) fn set_notify(&self, writer: Box<dyn Write + Send>) {
        *self.notify.lock() = Some(writer);
    }

    /// Resize the FIFO; non-zero sizes round up to a power of two
    pub(crate) fn set_capacity(&self, size: usize) {
        let capacity = if size == 0 { 0 } else { size.next_power_of_two() };
        let mut fifo = self.fifo.lock();
        fifo.capacity = capacity;
        while fifo.items.len() > capacity {
            fifo.items.pop_front();
            fifo.dropped += 1;
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.fifo.lock().capacity
    }

    /// Hand an item to the application
    pub(crate) fn push(&self, item: T) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(item);
            return;
        }

        let was_empty = {
            let mut fifo = self.fifo.lock();
            if fifo.closed {
                return;
            }
            if fifo.capacity == 0 {
                debug!(queue = self.name, "no FIFO and no callback, dropping item");
                return;
            }
            if fifo.items.len() >= fifo.capacity {
                fifo.items.pop_front();
                fifo.dropped += 1;
                warn!(
                    queue = self.name,
                    capacity = fifo.capacity,
                    dropped = fifo.dropped,
                    "output FIFO full, dropped oldest item"
                );
            }
            let was_empty = fifo.items.is_empty();
            fifo.items.push_back(item);
            was_empty
        };
        self.ready.notify_one();

        if was_empty {
            if let Some(writer) = self.notify.lock().as_mut() {
                if let Err(e) = writer.write_all(&[1]).and_then(|_| writer.flush()) {
                    debug!(queue = self.name, error = %e, "notify write failed");
                }
            }
        }
    }

    /// Oldest item, waiting up to `timeout`
    pub(crate) fn pop(&self, timeout: Duration) -> Result<Option<T>> {
        if self.has_callback() {
            return Err(RistError::DeliveryMode("a callback is registered"));
        }

        let deadline = Instant::now() + timeout;
        let mut fifo = self.fifo.lock();
        loop {
            if let Some(item) = fifo.items.pop_front() {
                return Ok(Some(item));
            }
            if fifo.closed {
                return Err(RistError::Destroyed);
            }
            if self.ready.wait_until(&mut fifo, deadline).timed_out() {
                return Ok(fifo.items.pop_front());
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.fifo.lock().items.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.fifo.lock().dropped
    }

    /// Free everything queued and wake blocked readers
    pub(crate) fn close(&self) {
        {
            let mut fifo = self.fifo.lock();
            fifo.closed = true;
            fifo.items.clear();
        }
        self.ready.notify_all();
        *self.callback.write() = None;
        *self.notify.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = DeliveryQueue::new("data", 8);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(Duration::ZERO).unwrap(), Some(1));
        assert_eq!(queue.pop(Duration::ZERO).unwrap(), Some(2));
        assert_eq!(queue.pop(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_full_drops_oldest() {
        let queue = DeliveryQueue::new("data", 2);
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.pop(Duration::ZERO).unwrap(), Some(3));
    }

    #[test]
    fn test_capacity_rounds_up() {
        let queue: DeliveryQueue<u8> = DeliveryQueue::new("data", 8);
        queue.set_capacity(100);
        assert_eq!(queue.capacity(), 128);
        queue.set_capacity(0);
        assert_eq!(queue.capacity(), 0);
    }

    #[test]
    fn test_callback_mode() {
        let queue = DeliveryQueue::new("data", 8);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        queue.set_callback(Arc::new(move |v: usize| {
            counter.fetch_add(v, Ordering::SeqCst);
        }));

        queue.push(3);
        queue.push(4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(queue.len(), 0);
        assert!(matches!(
            queue.pop(Duration::ZERO),
            Err(RistError::DeliveryMode(_))
        ));
    }

    #[test]
    fn test_notify_on_empty_transition() {
        let queue = DeliveryQueue::new("data", 8);
        let buf = SharedBuf::default();
        queue.set_notify(Box::new(buf.clone()));

        queue.push(1);
        queue.push(2);
        assert_eq!(buf.0.lock().len(), 1);

        queue.pop(Duration::ZERO).unwrap();
        queue.pop(Duration::ZERO).unwrap();
        queue.push(3);
        assert_eq!(buf.0.lock().len(), 2);
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(DeliveryQueue::new("data", 8));
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(9);
        });
        assert_eq!(queue.pop(Duration::from_secs(2)).unwrap(), Some(9));
        handle.join().unwrap();
    }

    #[test]
    fn test_close_fails_readers() {
        let queue: DeliveryQueue<u8> = DeliveryQueue::new("data", 8);
        queue.push(1);
        queue.close();
        assert!(matches!(queue.pop(Duration::ZERO), Err(RistError::Destroyed)));
    }

    proptest! {
        #[test]
        fn prop_fifo_keeps_newest_in_order(size in 1usize..100, pushes in 0usize..300) {
            let queue = DeliveryQueue::new("data", 0);
            queue.set_capacity(size);
            for i in 0..pushes {
                queue.push(i);
            }

            let kept = pushes.min(size.next_power_of_two());
            prop_assert_eq!(queue.len(), kept);
            prop_assert_eq!(queue.dropped(), (pushes - kept) as u64);
            let drained: Vec<usize> =
                std::iter::from_fn(|| queue.pop(Duration::ZERO).unwrap()).collect();
            prop_assert_eq!(drained, (pushes - kept..pushes).collect::<Vec<_>>());
        }
    }
}
