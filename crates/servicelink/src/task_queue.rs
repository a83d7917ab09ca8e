//! Deferred work handed to the designated thread.
//!
//! Background tasks never touch objects owned by the designated thread. They
//! schedule a task instead, and the owner drains its queue once per tick.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Queue owned by the designated thread.
#[derive(Debug)]
pub struct TaskQueue<T> {
    tx: UnboundedSender<T>,
    rx: UnboundedReceiver<T>,
}

/// Cloneable handle for scheduling onto a [`TaskQueue`] from any thread.
#[derive(Debug)]
pub struct TaskSender<T> {
    tx: UnboundedSender<T>,
}

impl<T> Clone for TaskSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> TaskSender<T> {
        TaskSender {
            tx: self.tx.clone(),
        }
    }

    /// Take every task scheduled so far without blocking.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.rx.try_recv().ok())
    }

    /// Drop every pending task. Returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        self.drain().count()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> TaskSender<T> {
    /// Returns `false` if the owning queue is gone.
    pub fn schedule(&self, task: T) -> bool {
        self.tx.send(task).is_ok()
    }
}
