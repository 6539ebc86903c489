//! The four awaitable state machines.
//!
//! Handshake, receive, send and shutdown share one skeleton:
//!
//! 1. **Attempt first.** The first poll drives the engine synchronously;
//!    if the operation completes, no interest is ever registered.
//! 2. **Translate want-states into arming.** The engine saying `WantRead`
//!    or `WantWrite` names the *queue* that blocks progress, not the
//!    caller's direction: a read that must flush pending ciphertext arms
//!    write interest, and a write that needs peer bytes arms read
//!    interest.
//! 3. **Drain on wake.** A wake-up performs kernel I/O until the transport
//!    reports not-ready, re-driving the engine after every byte exchange.
//!    Stopping earlier would lose edges on edge-triggered reactors.
//! 4. **Terminal cleanup.** Both direction slots are cleared before the
//!    result becomes observable, and dropping a pending future (that is,
//!    cancelling the operation) clears whatever it armed.

mod handshake;
mod recv;
mod send;
mod shutdown;

pub use handshake::Handshake;
pub use recv::Recv;
pub use send::Send;
pub use shutdown::Shutdown;

use std::io;
use std::task::{Poll, Waker};

use crate::controller::IoController;
use crate::engine::TlsEngine;
use crate::error::RawIoError;
use crate::raw::RawIo;
use crate::reactor::Direction;
use crate::scratch::Scratch;
use crate::tracing_compat::{trace, warn};

/// Result of pushing the engine's outbound queue to the kernel.
pub(crate) enum Flush {
    /// Outbound queue and staged chunk are both empty.
    Idle,
    /// The kernel refused; write interest should be armed.
    NotReady,
    /// The kernel accepted zero bytes for a non-empty chunk.
    Stalled,
}

/// Drain staged and queued ciphertext into the kernel until done or the
/// kernel refuses.
pub(crate) fn flush_ciphertext<T: RawIo>(
    io: &mut T,
    engine: &mut TlsEngine,
    scratch: &mut Scratch,
) -> Result<Flush, RawIoError> {
    loop {
        if scratch.is_drained() && scratch.stage_from(engine) == 0 {
            return Ok(Flush::Idle);
        }
        match io.raw_send(scratch.pending()) {
            Ok(0) => {
                warn!("kernel accepted a zero-length write");
                return Ok(Flush::Stalled);
            }
            Ok(n) => {
                trace!(bytes = n, "ciphertext sent");
                scratch.consume(n);
            }
            Err(RawIoError::NotReady) => return Ok(Flush::NotReady),
            Err(err) => return Err(err),
        }
    }
}

/// Result of draining the kernel into the engine's inbound queue.
pub(crate) enum Fill {
    /// The kernel has nothing more; the payload is the bytes fed this call.
    NotReady(usize),
    /// The peer reached end-of-file (already recorded on the engine).
    Eof(usize),
}

/// Read from the kernel until it reports not-ready or end-of-file, feeding
/// every chunk into the engine's inbound queue.
pub(crate) fn fill_inbound<T: RawIo>(
    io: &mut T,
    engine: &mut TlsEngine,
    scratch: &mut Scratch,
) -> Result<Fill, RawIoError> {
    let mut total = 0;
    loop {
        let outcome = {
            let buf = scratch.read_buf();
            let capacity = buf.len();
            io.raw_recv(buf).map(|n| (n, capacity))
        };
        match outcome {
            Ok((0, _)) => {
                engine.mark_peer_eof();
                return Ok(Fill::Eof(total));
            }
            Ok((n, capacity)) => {
                trace!(bytes = n, "ciphertext received");
                engine.feed_encrypted_input(&scratch.read_buf()[..n]);
                total += n;
                if n == capacity {
                    scratch.note_full_read();
                }
            }
            Err(RawIoError::NotReady) => return Ok(Fill::NotReady(total)),
            Err(err) => return Err(err),
        }
    }
}

/// Arm one direction on the controller, recording it on the future so the
/// terminal path (or a drop) can clear it.
///
/// A registration failure is returned as the error; the caller maps it
/// into its operation's error space.
pub(crate) fn arm(
    controller: &IoController,
    armed: &mut Option<Direction>,
    direction: Direction,
    waker: &Waker,
) -> io::Result<()> {
    controller.arm(direction, waker)?;
    *armed = Some(direction);
    Ok(())
}

/// Clear both direction slots; used on every terminal path.
pub(crate) fn release(controller: &IoController, armed: &mut Option<Direction>) {
    controller.disarm(Direction::Read);
    controller.disarm(Direction::Write);
    *armed = None;
}

/// Shorthand: finish an operation with `result`, clearing registrations
/// first so the result only becomes observable with clean slots.
pub(crate) fn finish<R>(
    controller: &IoController,
    armed: &mut Option<Direction>,
    result: R,
) -> Poll<R> {
    release(controller, armed);
    Poll::Ready(result)
}
