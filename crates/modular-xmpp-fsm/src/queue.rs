//! Bounded outgoing element queue with shutdown.
//!
//! A fresh queue starts shut down; the lookup state starts it when a
//! connection attempt begins. Shutting the queue down wakes every blocked
//! producer and consumer. Elements already queued stay until polled.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::QueueError;

struct Inner<E> {
    items: VecDeque<E>,
    shutdown: bool,
}

pub struct OutgoingQueue<E> {
    capacity: usize,
    inner: Mutex<Inner<E>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<E> OutgoingQueue<E> {
    /// Create a queue holding at most `capacity` elements. The queue starts
    /// shut down.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                shutdown: true,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start accepting elements. Returns `true` if the queue was shut down.
    pub fn start(&self) -> bool {
        let mut inner = self.lock();
        let was_shutdown = inner.shutdown;
        inner.shutdown = false;
        was_shutdown
    }

    /// Stop accepting elements and wake every waiter.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Insert without waiting.
    pub fn offer(&self, element: E) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.shutdown {
            return Err(QueueError::Shutdown);
        }
        if inner.items.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        inner.items.push_back(element);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Insert `element` and shut the queue down in one step, so nothing can
    /// be queued behind it.
    pub fn offer_and_shutdown(&self, element: E) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.shutdown {
            return Err(QueueError::Shutdown);
        }
        if inner.items.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        inner.items.push_back(element);
        inner.shutdown = true;
        drop(inner);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        Ok(())
    }

    /// Insert, waiting for free capacity. Fails if the queue is or becomes
    /// shut down while waiting.
    pub async fn put(&self, element: E) -> Result<(), QueueError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.shutdown {
                    return Err(QueueError::Shutdown);
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(element);
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Remove the head without waiting.
    pub fn poll(&self) -> Option<E> {
        let element = self.lock().items.pop_front();
        if element.is_some() {
            self.not_full.notify_one();
        }
        element
    }

    /// Remove the head, waiting for an element. Fails once the queue is
    /// shut down and drained.
    pub async fn take(&self) -> Result<E, QueueError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(element) = inner.items.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(element);
                }
                if inner.shutdown {
                    return Err(QueueError::Shutdown);
                }
            }
            notified.await;
        }
    }

    /// Remove every queued element.
    pub fn drain(&self) -> Vec<E> {
        let drained: Vec<E> = self.lock().items.drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }
}

impl<E> std::fmt::Debug for OutgoingQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("OutgoingQueue")
            .field("capacity", &self.capacity)
            .field("len", &inner.items.len())
            .field("shutdown", &inner.shutdown)
            .finish()
    }
}
