//! The receive awaitable.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::engine::EngineStatus;
use crate::error::{Cause, RawIoError, TlsError};
use crate::raw::RawIo;
use crate::reactor::Direction;
use crate::socket::TlsSocket;
use crate::tracing_compat::trace;

use super::{arm, finish, flush_ciphertext, release, Flush};

/// Future resolving to the number of plaintext bytes placed in the
/// caller's buffer.
///
/// Created by [`TlsSocket::recv`]. `Ok(0)` means the peer closed the
/// stream; every later receive resolves the same way immediately. A
/// kernel-reported disconnect during the read is treated as that same
/// end-of-stream, not as an error.
pub struct Recv<'a, T: RawIo> {
    pub(crate) sock: &'a mut TlsSocket<T>,
    pub(crate) buf: &'a mut [u8],
    pub(crate) armed: Option<Direction>,
}

impl<T: RawIo> Future for Recv<'_, T> {
    type Output = Result<usize, TlsError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Err(err) = this.sock.ensure_engine() {
            let controller = this.sock.controller();
            return finish(&controller, &mut this.armed, Err(err));
        }
        if this.buf.is_empty() {
            let controller = this.sock.controller();
            return finish(&controller, &mut this.armed, Ok(0));
        }

        loop {
            let sock = &mut *this.sock;
            let controller = sock.controller.clone();
            let engine = sock.engine.as_mut().expect("engine initialized above");

            // The engine may still hold decrypted data from a previous
            // record, so the read comes before any kernel I/O.
            match engine.read(this.buf) {
                EngineStatus::Success(n) => {
                    return finish(&controller, &mut this.armed, Ok(n));
                }
                EngineStatus::ZeroReturn => {
                    return finish(&controller, &mut this.armed, Ok(0));
                }
                EngineStatus::Fatal(err) => {
                    return finish(
                        &controller,
                        &mut this.armed,
                        Err(TlsError::ReadFailed(Cause::Tls(err))),
                    );
                }
                EngineStatus::WantWrite => {
                    // The engine has records it must send before it can
                    // produce more plaintext; drain them, waiting on write
                    // readiness if the kernel refuses.
                    match flush_ciphertext(&mut sock.io, engine, &mut sock.scratch) {
                        Ok(Flush::Idle) => {}
                        Ok(Flush::NotReady) => {
                            if let Err(err) =
                                arm(&controller, &mut this.armed, Direction::Write, cx.waker())
                            {
                                return finish(
                                    &controller,
                                    &mut this.armed,
                                    Err(TlsError::ReadFailed(Cause::Io(err))),
                                );
                            }
                            return Poll::Pending;
                        }
                        Ok(Flush::Stalled) => {
                            return finish(
                                &controller,
                                &mut this.armed,
                                Err(TlsError::ReadFailed(Cause::Stalled)),
                            );
                        }
                        Err(RawIoError::NotReady) => unreachable!("not-ready is a flush outcome"),
                        Err(RawIoError::Disconnected) => {
                            return finish(
                                &controller,
                                &mut this.armed,
                                Err(TlsError::ReadFailed(Cause::Disconnected)),
                            );
                        }
                        Err(RawIoError::Fatal(err)) => {
                            return finish(
                                &controller,
                                &mut this.armed,
                                Err(TlsError::ReadFailed(Cause::Io(err))),
                            );
                        }
                    }
                }
                EngineStatus::WantRead => {
                    // One chunk from the kernel, then retry the engine: a
                    // single record may already complete the read.
                    let outcome = {
                        let buf = sock.scratch.read_buf();
                        let capacity = buf.len();
                        sock.io.raw_recv(buf).map(|n| (n, capacity))
                    };
                    match outcome {
                        Ok((0, _)) => {
                            engine.mark_peer_eof();
                        }
                        Ok((n, capacity)) => {
                            trace!(bytes = n, "ciphertext received");
                            engine.feed_encrypted_input(&sock.scratch.read_buf()[..n]);
                            if n == capacity {
                                sock.scratch.note_full_read();
                            }
                        }
                        Err(RawIoError::NotReady) => {
                            if let Err(err) =
                                arm(&controller, &mut this.armed, Direction::Read, cx.waker())
                            {
                                return finish(
                                    &controller,
                                    &mut this.armed,
                                    Err(TlsError::ReadFailed(Cause::Io(err))),
                                );
                            }
                            return Poll::Pending;
                        }
                        Err(RawIoError::Disconnected) => {
                            // A kernel-level disconnect on the read side is
                            // the peer going away: end-of-stream.
                            return finish(&controller, &mut this.armed, Ok(0));
                        }
                        Err(RawIoError::Fatal(err)) => {
                            return finish(
                                &controller,
                                &mut this.armed,
                                Err(TlsError::ReadFailed(Cause::Io(err))),
                            );
                        }
                    }
                }
            }
        }
    }
}

impl<T: RawIo> Drop for Recv<'_, T> {
    fn drop(&mut self) {
        if self.armed.is_some() {
            let controller = self.sock.controller();
            release(&controller, &mut self.armed);
        }
    }
}
