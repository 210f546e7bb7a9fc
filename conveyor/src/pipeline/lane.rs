//! Lanes: the channels of the pipeline graph.
//!
//! A lane is a bounded channel whose sender may only hand an item over once
//! the receiver has asked for one by waiting in [`LaneReceiver::recv`].
//! Without a buffer this is a rendezvous: an item never sits in the lane of
//! a receiver that is busy elsewhere. A buffer of `n` lets `n` items run
//! ahead of the receiver.
//!
//! Requests are counted by a semaphore next to the item channel. The
//! receiver adds one permit per item it asks for; a sender takes one before
//! it may reserve a slot of the item channel.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};

/// The receiving side of the lane is gone. Carries back the unsent item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneClosed<T>(pub T);

impl<T> fmt::Display for LaneClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane closed")
    }
}

impl<T: fmt::Debug> std::error::Error for LaneClosed<T> {}

/// Create a lane letting `buffer` items run ahead of the receiver.
///
/// `buffer == 0` is a rendezvous.
pub fn channel<T>(buffer: usize) -> (LaneSender<T>, LaneReceiver<T>) {
    let (items_tx, items_rx) = mpsc::channel(buffer.saturating_add(1));
    let requests = Arc::new(Semaphore::new(buffer));
    (
        LaneSender {
            items: items_tx,
            requests: Arc::clone(&requests),
        },
        LaneReceiver {
            items: items_rx,
            requests,
            requested: false,
        },
    )
}

pub struct LaneSender<T> {
    items: mpsc::Sender<T>,
    requests: Arc<Semaphore>,
}

impl<T> Clone for LaneSender<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            requests: Arc::clone(&self.requests),
        }
    }
}

impl<T> fmt::Debug for LaneSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneSender")
            .field("requests", &self.requests.available_permits())
            .field("closed", &self.items.is_closed())
            .finish()
    }
}

impl<T> LaneSender<T> {
    /// Wait until the receiver asks for an item, then hand `item` over.
    pub async fn send(&self, item: T) -> Result<(), LaneClosed<T>> {
        match self.reserve().await {
            Ok(permit) => {
                permit.send(item);
                Ok(())
            }
            Err(LaneClosed(())) => Err(LaneClosed(item)),
        }
    }

    /// Wait until the receiver asks for an item and hold that request.
    ///
    /// Cancel safe. Dropping the permit unused gives the request back.
    pub async fn reserve(&self) -> Result<LanePermit<'_, T>, LaneClosed<()>> {
        loop {
            let request = self
                .requests
                .acquire()
                .await
                .map_err(|_| LaneClosed(()))?;

            match self.items.try_reserve() {
                Ok(slot) => {
                    request.forget();
                    return Ok(LanePermit {
                        slot: Some(slot),
                        requests: &self.requests,
                    });
                }
                Err(TrySendError::Closed(())) => return Err(LaneClosed(())),
                Err(TrySendError::Full(())) => {
                    drop(request);
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.items.is_closed()
    }
}

/// A granted request; [`send`](Self::send) delivers without waiting.
pub struct LanePermit<'a, T> {
    slot: Option<mpsc::Permit<'a, T>>,
    requests: &'a Semaphore,
}

impl<T> LanePermit<'_, T> {
    pub fn send(mut self, item: T) {
        if let Some(slot) = self.slot.take() {
            slot.send(item);
        }
    }
}

impl<T> Drop for LanePermit<'_, T> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.requests.add_permits(1);
        }
    }
}

pub struct LaneReceiver<T> {
    items: mpsc::Receiver<T>,
    requests: Arc<Semaphore>,
    /// A request is outstanding that no item has answered yet.
    requested: bool,
}

impl<T> fmt::Debug for LaneReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneReceiver")
            .field("requested", &self.requested)
            .finish()
    }
}

impl<T> LaneReceiver<T> {
    /// Ask for the next item and wait for it.
    ///
    /// Returns `None` once every sender is gone and the buffer is empty.
    /// Cancel safe: a request left by a dropped call carries over to the
    /// next one.
    pub async fn recv(&mut self) -> Option<T> {
        if !self.requested {
            self.requests.add_permits(1);
            self.requested = true;
        }
        let item = self.items.recv().await;
        if item.is_some() {
            self.requested = false;
        }
        item
    }

    /// Refuse further items; buffered items can still be received.
    pub fn close(&mut self) {
        self.requests.close();
        self.items.close();
    }
}

impl<T> Drop for LaneReceiver<T> {
    fn drop(&mut self) {
        self.requests.close();
    }
}
