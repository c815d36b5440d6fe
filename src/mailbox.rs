//! Correlation queues pairing posted protocol messages with waiting tasks
//!
//! Nothing on the wire ties a gateway message to the command that caused it;
//! correlation is purely positional. A [`Mailbox`] bridges the two sides: the
//! reader task posts each decoded message into the mailbox for its type, and
//! protocol logic claims them, consuming a value that already arrived or
//! waiting for the next one.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::oneshot;

/// The mailbox was closed while a value was still awaited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the connection serving this mailbox is gone")]
pub struct MailboxClosed;

#[derive(Debug)]
struct Inner<T> {
    buffered: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    closed: bool,
}

/// A FIFO hand-off point between one producer and any number of consumers
///
/// Values posted with no consumer waiting are buffered and handed out, oldest
/// first, to later claims. Claims made with no value buffered resolve when a
/// later post arrives. A claim that is dropped before resolving gives up its
/// place in line.
#[derive(Debug, Clone)]
pub struct Mailbox<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            inner: Arc::new(Mutex::new(Inner {
                buffered: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Reserves the next value without awaiting it yet
    ///
    /// The returned [`Claim`] resolves to the oldest buffered value, or to the
    /// next posted one if the buffer is empty. Taking the claim first and
    /// awaiting it later is what lets a consumer reserve its place in line
    /// before issuing the command that will produce the value.
    pub fn claim(&self) -> Claim<T> {
        let mut inner = self.lock();
        if inner.closed {
            return Claim::Closed;
        }
        match inner.buffered.pop_front() {
            Some(value) => Claim::Ready(value),
            None => {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                Claim::Wait(rx)
            }
        }
    }

    /// Claims and awaits the next value in one step
    pub async fn recv(&self) -> Result<T, MailboxClosed> {
        self.claim().wait().await
    }

    /// Discards anything already buffered, then awaits the next value
    ///
    /// Used where a stale value would satisfy the wait vacuously, e.g. when
    /// polling for a status that must reflect a command just sent.
    pub async fn recv_fresh(&self) -> Result<T, MailboxClosed> {
        let claim = {
            let mut inner = self.lock();
            if inner.closed {
                Claim::Closed
            } else {
                inner.buffered.clear();
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                Claim::Wait(rx)
            }
        };
        claim.wait().await
    }

    /// Drops all buffered values
    pub fn clear_stale(&self) {
        self.lock().buffered.clear();
    }

    /// Delivers a value to the oldest live waiter, or buffers it
    ///
    /// Waiters whose claims were dropped in the meantime are skipped and
    /// forgotten. Posting to a closed mailbox discards the value.
    pub fn post(&self, mut value: T) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(value) {
                Ok(()) => return,
                Err(returned) => value = returned,
            }
        }
        inner.buffered.push_back(value);
    }

    /// Fails every pending and future claim with [`MailboxClosed`]
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.buffered.clear();
        inner.waiters.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved place in line for one value from a [`Mailbox`]
#[derive(Debug)]
pub enum Claim<T> {
    Ready(T),
    Wait(oneshot::Receiver<T>),
    Closed,
}

impl<T> Claim<T> {
    /// Whether the value was already buffered when the claim was made
    pub fn is_ready(&self) -> bool {
        matches!(self, Claim::Ready(_))
    }

    /// Resolves the claim, waiting for the value if it has not arrived yet
    pub async fn wait(self) -> Result<T, MailboxClosed> {
        match self {
            Claim::Ready(value) => Ok(value),
            Claim::Wait(rx) => rx.await.map_err(|_| MailboxClosed),
            Claim::Closed => Err(MailboxClosed),
        }
    }
}
