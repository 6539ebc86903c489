//! The send awaitable.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::engine::EngineStatus;
use crate::error::{Cause, RawIoError, TlsError};
use crate::raw::RawIo;
use crate::reactor::Direction;
use crate::socket::TlsSocket;
use crate::tracing_compat::{trace, warn};

use super::{arm, finish, release};

/// Future resolving once the whole plaintext buffer has been accepted by
/// the engine and the resulting ciphertext drained to the kernel.
///
/// Created by [`TlsSocket::send`]. Completion is all-or-error: `Ok(n)`
/// always equals the caller's buffer length, and the internal chunking is
/// invisible. A cancelled send makes no claim about how much plaintext was
/// transmitted.
pub struct Send<'a, T: RawIo> {
    pub(crate) sock: &'a mut TlsSocket<T>,
    pub(crate) buf: &'a [u8],
    pub(crate) plain_offset: usize,
    pub(crate) armed: Option<Direction>,
}

impl<T: RawIo> Future for Send<'_, T> {
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

            // Send the staged ciphertext chunk first.
            if !sock.scratch.is_drained() {
                match sock.io.raw_send(sock.scratch.pending()) {
                    Ok(0) => {
                        // A zero-length kernel write means no progress; it
                        // is observed and surfaced, never retried.
                        warn!("kernel accepted a zero-length write");
                        return finish(
                            &controller,
                            &mut this.armed,
                            Err(TlsError::WriteFailed(Cause::Stalled)),
                        );
                    }
                    Ok(n) => {
                        trace!(bytes = n, "ciphertext sent");
                        sock.scratch.consume(n);
                        continue;
                    }
                    Err(RawIoError::NotReady) => {
                        if let Err(err) =
                            arm(&controller, &mut this.armed, Direction::Write, cx.waker())
                        {
                            return finish(
                                &controller,
                                &mut this.armed,
                                Err(TlsError::WriteFailed(Cause::Io(err))),
                            );
                        }
                        return Poll::Pending;
                    }
                    Err(RawIoError::Disconnected) => {
                        return finish(&controller, &mut this.armed, Err(TlsError::PeerClosed));
                    }
                    Err(RawIoError::Fatal(err)) => {
                        return finish(
                            &controller,
                            &mut this.armed,
                            Err(TlsError::WriteFailed(Cause::Io(err))),
                        );
                    }
                }
            }

            // Stage the next chunk of queued ciphertext, if any.
            if sock.scratch.stage_from(engine) > 0 {
                continue;
            }

            // Nothing queued: feed the engine more plaintext, or finish.
            if this.plain_offset >= this.buf.len() {
                return finish(&controller, &mut this.armed, Ok(this.buf.len()));
            }
            match engine.write(&this.buf[this.plain_offset..]) {
                EngineStatus::Success(n) => {
                    this.plain_offset += n;
                }
                EngineStatus::WantWrite => {
                    // The session buffer is full; its ciphertext is now on
                    // the outbound queue and the next iteration stages it.
                }
                EngineStatus::WantRead => {
                    // The engine needs peer bytes before accepting more
                    // plaintext; wait on read readiness.
                    let outcome = {
                        let buf = sock.scratch.read_buf();
                        let capacity = buf.len();
                        sock.io.raw_recv(buf).map(|n| (n, capacity))
                    };
                    match outcome {
                        Ok((0, _)) => {
                            return finish(&controller, &mut this.armed, Err(TlsError::PeerClosed));
                        }
                        Ok((n, capacity)) => {
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
                                    Err(TlsError::WriteFailed(Cause::Io(err))),
                                );
                            }
                            return Poll::Pending;
                        }
                        Err(RawIoError::Disconnected) => {
                            return finish(&controller, &mut this.armed, Err(TlsError::PeerClosed));
                        }
                        Err(RawIoError::Fatal(err)) => {
                            return finish(
                                &controller,
                                &mut this.armed,
                                Err(TlsError::WriteFailed(Cause::Io(err))),
                            );
                        }
                    }
                }
                EngineStatus::ZeroReturn => {
                    return finish(&controller, &mut this.armed, Err(TlsError::PeerClosed));
                }
                EngineStatus::Fatal(err) => {
                    return finish(
                        &controller,
                        &mut this.armed,
                        Err(TlsError::WriteFailed(Cause::Tls(err))),
                    );
                }
            }
        }
    }
}

impl<T: RawIo> Drop for Send<'_, T> {
    fn drop(&mut self) {
        if self.armed.is_some() {
            let controller = self.sock.controller();
            release(&controller, &mut self.armed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TlsConfig, VerifyMode};
    use crate::controller::IoController;
    use crate::identity::{CertificateChain, PrivateKey};
    use crate::reactor::Reactor;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::task::{Wake, Waker};

    #[derive(Default)]
    struct PermissiveReactor;

    impl Reactor for PermissiveReactor {
        fn arm_read(&self, _controller: &IoController) -> std::io::Result<()> {
            Ok(())
        }

        fn arm_write(&self, _controller: &IoController) -> std::io::Result<()> {
            Ok(())
        }

        fn disarm(&self, _controller: &IoController, _direction: Direction) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Write side accepts at most `cap` bytes per call and can be told to
    /// return a zero-length write once.
    struct MeteredIo {
        sent: Rc<RefCell<Vec<u8>>>,
        cap: usize,
        zero_once: bool,
    }

    impl RawIo for MeteredIo {
        fn raw_recv(&mut self, _buf: &mut [u8]) -> Result<usize, RawIoError> {
            Err(RawIoError::NotReady)
        }

        fn raw_send(&mut self, buf: &[u8]) -> Result<usize, RawIoError> {
            if self.zero_once {
                self.zero_once = false;
                return Ok(0);
            }
            let n = buf.len().min(self.cap);
            self.sent.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    struct NoopWake;

    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    fn handshaken_pair_config() -> (TlsConfig, TlsConfig) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let chain = CertificateChain::from_pem(generated.cert.pem().as_bytes()).unwrap();
        let key = PrivateKey::from_pem(generated.key_pair.serialize_pem().as_bytes()).unwrap();
        let server = TlsConfig::server(chain, key).build().unwrap();
        let client = TlsConfig::client()
            .verify_mode(VerifyMode::None)
            .build()
            .unwrap();
        (client, server)
    }

    // Drive two engines to completion by direct queue shuttling.
    fn handshake_engines(
        client: &mut crate::engine::TlsEngine,
        server: &mut crate::engine::TlsEngine,
    ) {
        let mut buf = [0u8; 4096];
        for _ in 0..32 {
            let c = client.do_handshake();
            let s = server.do_handshake();
            loop {
                let n = client.extract_encrypted_output(&mut buf);
                if n == 0 {
                    break;
                }
                server.feed_encrypted_input(&buf[..n]);
            }
            loop {
                let n = server.extract_encrypted_output(&mut buf);
                if n == 0 {
                    break;
                }
                client.feed_encrypted_input(&buf[..n]);
            }
            if matches!(c, EngineStatus::Success(_)) && matches!(s, EngineStatus::Success(_)) {
                return;
            }
        }
        panic!("handshake did not converge");
    }

    fn handshaken_socket(io: MeteredIo) -> (TlsSocket<MeteredIo>, crate::engine::TlsEngine) {
        let (client_cfg, server_cfg) = handshaken_pair_config();
        let controller = IoController::new(0, Rc::new(PermissiveReactor));
        let mut sock = TlsSocket::new(client_cfg, io, controller);
        sock.set_hostname("localhost").unwrap();
        sock.ensure_engine().unwrap();

        let mut server = crate::engine::TlsEngine::server(&server_cfg).unwrap();
        handshake_engines(sock.engine_mut_for_test(), &mut server);
        (sock, server)
    }

    #[test]
    fn partial_kernel_writes_still_complete() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let io = MeteredIo {
            sent: Rc::clone(&sent),
            cap: 7,
            zero_once: false,
        };
        let (mut sock, mut server) = handshaken_socket(io);

        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);

        let payload = b"the quick brown fox jumps over the lazy dog";
        let result = {
            let mut send = sock.send(payload);
            match Pin::new(&mut send).poll(&mut cx) {
                Poll::Ready(result) => result,
                Poll::Pending => panic!("metered transport never refuses, only truncates"),
            }
        };
        assert_eq!(result.unwrap(), payload.len());

        // Everything the kernel saw decrypts on the peer to the payload.
        server.feed_encrypted_input(&sent.borrow());
        let mut buf = [0u8; 256];
        match server.read(&mut buf) {
            EngineStatus::Success(n) => assert_eq!(&buf[..n], payload),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn zero_length_kernel_write_is_an_error_not_a_loop() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let io = MeteredIo {
            sent,
            cap: 1024,
            zero_once: true,
        };
        let (mut sock, _server) = handshaken_socket(io);

        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);

        let result = {
            let mut send = sock.send(b"payload");
            match Pin::new(&mut send).poll(&mut cx) {
                Poll::Ready(result) => result,
                Poll::Pending => panic!("zero-length write must resolve the operation"),
            }
        };
        assert!(matches!(
            result,
            Err(TlsError::WriteFailed(Cause::Stalled))
        ));
    }

    #[test]
    fn empty_send_completes_immediately() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let io = MeteredIo {
            sent,
            cap: 1024,
            zero_once: false,
        };
        let (mut sock, _server) = handshaken_socket(io);

        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);

        let mut send = sock.send(b"");
        match Pin::new(&mut send).poll(&mut cx) {
            Poll::Ready(Ok(0)) => {}
            other => panic!("unexpected poll result {other:?}"),
        }
    }
}
