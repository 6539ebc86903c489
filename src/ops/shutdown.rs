//! The shutdown awaitable.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::engine::EngineStatus;
use crate::error::{RawIoError, TlsError};
use crate::raw::RawIo;
use crate::reactor::Direction;
use crate::socket::TlsSocket;
use crate::tracing_compat::warn;

use super::{arm, fill_inbound, finish, flush_ciphertext, release, Fill, Flush};

/// Future driving the close-notify exchange.
///
/// Created by [`TlsSocket::shutdown`]. Fatal errors are swallowed: a
/// connection that cannot close gracefully is still going to be closed,
/// so the only way this future resolves is `Ok(())`. Swallowed failures
/// are logged at warn level. Shutting down twice is fine.
pub struct Shutdown<'a, T: RawIo> {
    pub(crate) sock: &'a mut TlsSocket<T>,
    pub(crate) armed: Option<Direction>,
}

impl<T: RawIo> Future for Shutdown<'_, T> {
    type Output = Result<(), TlsError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // A socket that never ran a handshake has no TLS session to close.
        if !this.sock.has_engine() {
            let controller = this.sock.controller();
            return finish(&controller, &mut this.armed, Ok(()));
        }

        loop {
            let sock = &mut *this.sock;
            let controller = sock.controller.clone();
            let engine = sock.engine.as_mut().expect("engine initialized above");

            match engine.shutdown() {
                EngineStatus::Success(_) | EngineStatus::ZeroReturn => {
                    return finish(&controller, &mut this.armed, Ok(()));
                }
                EngineStatus::Fatal(err) => {
                    warn!(error = %err, "shutdown failed, closing anyway");
                    return finish(&controller, &mut this.armed, Ok(()));
                }
                EngineStatus::WantWrite => {
                    match flush_ciphertext(&mut sock.io, engine, &mut sock.scratch) {
                        Ok(Flush::Idle) => {}
                        Ok(Flush::NotReady) => {
                            if let Err(err) =
                                arm(&controller, &mut this.armed, Direction::Write, cx.waker())
                            {
                                warn!(error = %err, "shutdown arming failed, closing anyway");
                                return finish(&controller, &mut this.armed, Ok(()));
                            }
                            return Poll::Pending;
                        }
                        Ok(Flush::Stalled) => {
                            warn!("zero-length write during shutdown, closing anyway");
                            return finish(&controller, &mut this.armed, Ok(()));
                        }
                        Err(err) => {
                            warn!(error = %err, "transport failed during shutdown, closing anyway");
                            return finish(&controller, &mut this.armed, Ok(()));
                        }
                    }
                }
                EngineStatus::WantRead => {
                    match fill_inbound(&mut sock.io, engine, &mut sock.scratch) {
                        Ok(Fill::NotReady(0)) => {
                            if let Err(err) =
                                arm(&controller, &mut this.armed, Direction::Read, cx.waker())
                            {
                                warn!(error = %err, "shutdown arming failed, closing anyway");
                                return finish(&controller, &mut this.armed, Ok(()));
                            }
                            return Poll::Pending;
                        }
                        Ok(Fill::NotReady(_) | Fill::Eof(_)) => {}
                        Err(RawIoError::Disconnected) => {
                            // The peer is gone; that settles the close.
                            return finish(&controller, &mut this.armed, Ok(()));
                        }
                        Err(err) => {
                            warn!(error = %err, "transport failed during shutdown, closing anyway");
                            return finish(&controller, &mut this.armed, Ok(()));
                        }
                    }
                }
            }
        }
    }
}

impl<T: RawIo> Drop for Shutdown<'_, T> {
    fn drop(&mut self) {
        if self.armed.is_some() {
            let controller = self.sock.controller();
            release(&controller, &mut self.armed);
        }
    }
}
