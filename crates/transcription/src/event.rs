//! Single-slot wake signal between the native callback thread and the
//! consumer's pull loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

/// An asynchronous auto-reset event.
///
/// `set` marks the event fired and wakes the pending waiter, if any; `wait`
/// consumes a pending fired state immediately, otherwise suspends until the
/// next `set`. A signal that arrives before the wait begins is never lost.
/// Lock-free: one atomic flag plus a swappable waker slot. This carries no
/// payload; data travels through a separate queue.
#[derive(Debug, Default)]
pub struct AutoResetEvent {
    signaled: AtomicBool,
    waker: AtomicWaker,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the event, waking the registered waiter or latching the
    /// signal for the next `wait`.
    pub fn set(&self) {
        self.signaled.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Clears any latched signal without waking anyone.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Waits for the next signal, consuming it.
    pub fn wait(&self) -> Wait<'_> {
        Wait { event: self }
    }
}

pub struct Wait<'a> {
    event: &'a AutoResetEvent,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.event.signaled.swap(false, Ordering::AcqRel) {
            return Poll::Ready(());
        }
        self.event.waker.register(cx.waker());
        // Re-check: a signal may have landed between the swap and the
        // waker registration.
        if self.event.signaled.swap(false, Ordering::AcqRel) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
