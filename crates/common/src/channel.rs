//! Unbounded queue bridging blocking driver threads and the Tokio runtime
//!
//! Driver calls block for unbounded time, so they run on dedicated OS threads.
//! Those threads talk to async code through this queue: pushing never blocks
//! and never fails while a receiver is alive, and both ends can be used from
//! either world (`recv` from tasks, `recv_blocking` from threads).

use async_channel::{Receiver, Sender, TryRecvError, unbounded};

/// Producer half (cloneable, never blocks)
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Append an item to the queue
    ///
    /// Fails only when every receiver has been dropped or the queue was
    /// closed.
    pub fn push(&self, item: T) -> crate::Result<()> {
        self.tx
            .try_send(item)
            .map_err(|_| crate::Error::Channel("queue closed".to_string()))
    }

    /// Close the queue; receivers drain what is left and then see an error
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Receive the next item from async context
    pub async fn recv(&self) -> crate::Result<T> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next item from a blocking thread
    pub fn recv_blocking(&self) -> crate::Result<T> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take an item if one is queued
    ///
    /// Returns `Ok(None)` on an empty but open queue.
    pub fn try_recv(&self) -> crate::Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(crate::Error::Channel("queue closed".to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn close(&self) -> bool {
        self.rx.close()
    }
}

/// Create an unbounded, strictly ordered queue
pub fn unbounded_queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = unbounded();
    (QueueSender { tx }, QueueReceiver { rx })
}
