//! The handshake awaitable.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::controller::IoController;
use crate::engine::{EngineStatus, TlsEngine};
use crate::error::{Cause, RawIoError, TlsError};
use crate::raw::RawIo;
use crate::reactor::Direction;
use crate::scratch::Scratch;
use crate::socket::TlsSocket;
use crate::tracing_compat::debug;

use super::{arm, fill_inbound, finish, flush_ciphertext, release, Fill, Flush};

/// Future driving the TLS handshake to completion.
///
/// Created by [`TlsSocket::handshake`]. The handshake tolerates any number
/// of round trips; it resolves once the engine reports completion *and*
/// every outbound byte has reached the kernel, including TLS 1.3
/// post-handshake messages already queued.
pub struct Handshake<'a, T: RawIo> {
    pub(crate) sock: &'a mut TlsSocket<T>,
    pub(crate) armed: Option<Direction>,
}

impl<T: RawIo> Future for Handshake<'_, T> {
    type Output = Result<(), TlsError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Err(err) = this.sock.ensure_engine() {
            let controller = this.sock.controller();
            return finish(&controller, &mut this.armed, Err(err));
        }

        loop {
            let sock = &mut *this.sock;
            let controller = sock.controller.clone();
            let engine = sock.engine.as_mut().expect("engine initialized above");

            match engine.do_handshake() {
                EngineStatus::Success(_) => {
                    // Flush what the completed handshake left behind: the
                    // final flight, or post-handshake messages such as
                    // NewSessionTicket.
                    if let Some(poll) = flush_step(
                        &mut sock.io,
                        engine,
                        &mut sock.scratch,
                        &controller,
                        &mut this.armed,
                        cx.waker(),
                    ) {
                        return poll;
                    }
                    let result = sock.check_negotiation();
                    debug!("handshake finished");
                    return finish(&controller, &mut this.armed, result);
                }
                EngineStatus::WantRead => {
                    // The pending flight goes out before we wait for the
                    // peer's answer.
                    if let Some(poll) = flush_step(
                        &mut sock.io,
                        engine,
                        &mut sock.scratch,
                        &controller,
                        &mut this.armed,
                        cx.waker(),
                    ) {
                        return poll;
                    }
                    match fill_inbound(&mut sock.io, engine, &mut sock.scratch) {
                        Ok(Fill::NotReady(0)) => {
                            if let Err(err) =
                                arm(&controller, &mut this.armed, Direction::Read, cx.waker())
                            {
                                return finish(
                                    &controller,
                                    &mut this.armed,
                                    Err(TlsError::HandshakeFailed(Cause::Io(err))),
                                );
                            }
                            return Poll::Pending;
                        }
                        // Bytes arrived, or end-of-file was recorded on the
                        // engine; either way the engine decides next.
                        Ok(Fill::NotReady(_) | Fill::Eof(_)) => {}
                        Err(raw) => {
                            return finish(&controller, &mut this.armed, Err(raw_error(raw)));
                        }
                    }
                }
                EngineStatus::WantWrite => {
                    if let Some(poll) = flush_step(
                        &mut sock.io,
                        engine,
                        &mut sock.scratch,
                        &controller,
                        &mut this.armed,
                        cx.waker(),
                    ) {
                        return poll;
                    }
                }
                EngineStatus::ZeroReturn => {
                    return finish(&controller, &mut this.armed, Err(TlsError::PeerClosed));
                }
                EngineStatus::Fatal(err) => {
                    return finish(&controller, &mut this.armed, Err(fatal_error(err)));
                }
            }
        }
    }
}

impl<T: RawIo> Drop for Handshake<'_, T> {
    fn drop(&mut self) {
        if self.armed.is_some() {
            let controller = self.sock.controller();
            release(&controller, &mut self.armed);
        }
    }
}

// Push pending ciphertext to the kernel. `None` means flushed and the
// state machine continues; `Some(poll)` is the caller's return value
// (pending with write interest armed, or a terminal failure).
fn flush_step<T: RawIo>(
    io: &mut T,
    engine: &mut TlsEngine,
    scratch: &mut Scratch,
    controller: &IoController,
    armed: &mut Option<Direction>,
    waker: &Waker,
) -> Option<Poll<Result<(), TlsError>>> {
    match flush_ciphertext(io, engine, scratch) {
        Ok(Flush::Idle) => None,
        Ok(Flush::NotReady) => Some(match arm(controller, armed, Direction::Write, waker) {
            Ok(()) => Poll::Pending,
            Err(err) => finish(
                controller,
                armed,
                Err(TlsError::HandshakeFailed(Cause::Io(err))),
            ),
        }),
        Ok(Flush::Stalled) => Some(finish(
            controller,
            armed,
            Err(TlsError::HandshakeFailed(Cause::Stalled)),
        )),
        Err(raw) => Some(finish(controller, armed, Err(raw_error(raw)))),
    }
}

fn raw_error(err: RawIoError) -> TlsError {
    match err {
        RawIoError::NotReady => unreachable!("not-ready is handled before conversion"),
        RawIoError::Disconnected => TlsError::PeerClosed,
        RawIoError::Fatal(io_err) => TlsError::HandshakeFailed(Cause::Io(io_err)),
    }
}

fn fatal_error(err: rustls::Error) -> TlsError {
    match err {
        rustls::Error::InvalidCertificate(_) => TlsError::VerificationFailed(err),
        _ => TlsError::HandshakeFailed(Cause::Tls(err)),
    }
}
