use crate::error::{Error, Result};
use crate::message::Frame;

use log::trace;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

pub(super) type ReplySlot = oneshot::Receiver<Result<Frame>>;

/// Calls waiting for a reply, keyed by serial.
///
/// The lock is only ever held for the map update itself. Once closed, the
/// map stays empty and refuses new calls.
#[derive(Default)]
pub(super) struct PendingCalls {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    calls: HashMap<u32, oneshot::Sender<Result<Frame>>>,
    closed: bool,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn register(&self, serial: u32) -> Result<ReplySlot> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(serial, tx);
        Ok(rx)
    }

    /// Hand `reply` to the call waiting on `serial`. False if nobody is.
    pub(super) fn resolve(&self, serial: u32, reply: Frame) -> bool {
        let waiter = self.lock().calls.remove(&serial);
        match waiter {
            Some(tx) => {
                // The caller may have given up since; nothing to do then.
                let _ = tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Forget `serial` without resolving it.
    pub(super) fn cancel(&self, serial: u32) {
        if self.lock().calls.remove(&serial).is_some() {
            trace!("call {} abandoned by its caller", serial);
        }
    }

    /// Fail every waiting call with `err` and refuse new ones.
    pub(super) fn close(&self, err: &Error) -> usize {
        let calls = {
            let mut inner = self.lock();
            inner.closed = true;
            std::mem::take(&mut inner.calls)
        };
        let count = calls.len();
        for (_, tx) in calls {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub(super) fn contains(&self, serial: u32) -> bool {
        self.lock().calls.contains_key(&serial)
    }

    pub(super) fn len(&self) -> usize {
        self.lock().calls.len()
    }
}

/// Removes a call from the map if its caller stops waiting, whether by
/// timeout or by the call future being dropped.
pub(super) struct PendingGuard<'a> {
    pub(super) pending: &'a PendingCalls,
    pub(super) serial: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.serial);
    }
}
