//! Per-connection reactor registration.
//!
//! An [`IoController`] ties one socket handle to the reactor and holds the
//! tasks waiting on it: at most one per direction. The awaitables arm a
//! direction by storing their waker and registering interest; the reactor
//! resumes them through [`dispatch`](IoController::dispatch).
//!
//! The two-slot shape is an invariant, not a limit to engineer around: a
//! socket is driven by one operation at a time, and a single operation
//! never needs more than one pending wait per direction. Because each
//! operation holds an exclusive borrow of its socket, an occupied slot can
//! only belong to the same operation re-arming itself after a wake, and
//! the waker is simply replaced.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::task::Waker;

use crate::reactor::{Direction, Reactor, Readiness};
use crate::tracing_compat::trace;

/// Registration of one socket handle with the reactor, plus the pending
/// task slots the reactor resumes on readiness.
pub struct IoController {
    handle: RawFd,
    reactor: Rc<dyn Reactor>,
    read_task: RefCell<Option<Waker>>,
    write_task: RefCell<Option<Waker>>,
}

impl IoController {
    /// Create a controller for `handle`, registered with `reactor`.
    #[must_use]
    pub fn new(handle: RawFd, reactor: Rc<dyn Reactor>) -> Rc<Self> {
        Rc::new(Self {
            handle,
            reactor,
            read_task: RefCell::new(None),
            write_task: RefCell::new(None),
        })
    }

    /// The OS handle this controller covers.
    #[must_use]
    pub fn handle(&self) -> RawFd {
        self.handle
    }

    /// Arm the given direction: store the waker and register interest.
    pub fn arm(&self, direction: Direction, waker: &Waker) -> io::Result<()> {
        trace!(?direction, fd = self.handle, "arm");
        *self.slot(direction).borrow_mut() = Some(waker.clone());
        match direction {
            Direction::Read => self.reactor.arm_read(self),
            Direction::Write => self.reactor.arm_write(self),
        }
    }

    /// Clear the given direction: drop the pending waker and deregister
    /// interest. Deregistration errors are ignored; the handle may already
    /// be gone.
    pub fn disarm(&self, direction: Direction) {
        let had_task = self.slot(direction).borrow_mut().take().is_some();
        if had_task {
            trace!(?direction, fd = self.handle, "disarm");
        }
        let _ = self.reactor.disarm(self, direction);
    }

    /// Whether a task is pending in the given direction.
    #[must_use]
    pub fn has_pending(&self, direction: Direction) -> bool {
        self.slot(direction).borrow().is_some()
    }

    /// Resume the tasks matching the delivered readiness.
    ///
    /// The reactor calls this from its event loop. Taking the waker out of
    /// the slot before waking keeps the invariant that a delivered event
    /// consumes the registration.
    pub fn dispatch(&self, ready: Readiness) {
        if ready.is_readable() {
            if let Some(waker) = self.read_task.borrow_mut().take() {
                waker.wake();
            }
        }
        if ready.is_writable() {
            if let Some(waker) = self.write_task.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    fn slot(&self, direction: Direction) -> &RefCell<Option<Waker>> {
        match direction {
            Direction::Read => &self.read_task,
            Direction::Write => &self.write_task,
        }
    }
}

impl std::fmt::Debug for IoController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoController")
            .field("handle", &self.handle)
            .field("read_pending", &self.has_pending(Direction::Read))
            .field("write_pending", &self.has_pending(Direction::Write))
            .finish_non_exhaustive()
    }
}
