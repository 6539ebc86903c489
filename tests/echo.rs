//! End-to-end scenarios over an in-memory transport.
//!
//! Two sockets are wired back-to-back through byte queues that play the
//! kernel's role: reads drain them, writes fill them, and both sides can
//! be artificially choked (forcing readiness waits) or capped (forcing
//! partial writes). A recording reactor stands in for the event loop; the
//! tests poll the futures directly, which is exactly what a scheduler
//! would do on readiness.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use tlsbridge::{
    CertificateChain, Direction, IoController, PrivateKey, RawIo, RawIoError, Reactor,
    RootCertStore, TlsConfig, TlsError, TlsSocket, VerifyMode,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Wire {
    data: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory duplex connection.
struct PipeEnd {
    rx: Rc<RefCell<Wire>>,
    tx: Rc<RefCell<Wire>>,
    /// Maximum bytes accepted per `raw_send`; forces partial writes.
    send_cap: usize,
    /// Number of upcoming `raw_send` calls to refuse with `NotReady`.
    choked_sends: Rc<Cell<usize>>,
}

impl RawIo for PipeEnd {
    fn raw_recv(&mut self, buf: &mut [u8]) -> Result<usize, RawIoError> {
        let mut rx = self.rx.borrow_mut();
        if rx.data.is_empty() {
            if rx.closed {
                return Ok(0);
            }
            return Err(RawIoError::NotReady);
        }
        let n = buf.len().min(rx.data.len());
        for (dst, src) in buf.iter_mut().zip(rx.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn raw_send(&mut self, buf: &[u8]) -> Result<usize, RawIoError> {
        let choked = self.choked_sends.get();
        if choked > 0 {
            self.choked_sends.set(choked - 1);
            return Err(RawIoError::NotReady);
        }
        let mut tx = self.tx.borrow_mut();
        if tx.closed {
            return Err(RawIoError::Disconnected);
        }
        let n = buf.len().min(self.send_cap);
        tx.data.extend(&buf[..n]);
        Ok(n)
    }
}

struct Duplex {
    client_io: PipeEnd,
    server_io: PipeEnd,
    client_rx: Rc<RefCell<Wire>>,
    client_tx: Rc<RefCell<Wire>>,
    client_choke: Rc<Cell<usize>>,
}

fn duplex(send_cap: usize) -> Duplex {
    let a = Rc::new(RefCell::new(Wire::default()));
    let b = Rc::new(RefCell::new(Wire::default()));
    let client_choke = Rc::new(Cell::new(0));
    Duplex {
        client_io: PipeEnd {
            rx: Rc::clone(&a),
            tx: Rc::clone(&b),
            send_cap,
            choked_sends: Rc::clone(&client_choke),
        },
        server_io: PipeEnd {
            rx: Rc::clone(&b),
            tx: Rc::clone(&a),
            send_cap,
            choked_sends: Rc::new(Cell::new(0)),
        },
        client_rx: a,
        client_tx: b,
        client_choke,
    }
}

#[derive(Default)]
struct TestReactor {
    log: RefCell<Vec<(i32, Direction)>>,
}

impl Reactor for TestReactor {
    fn arm_read(&self, controller: &IoController) -> std::io::Result<()> {
        self.log
            .borrow_mut()
            .push((controller.handle(), Direction::Read));
        Ok(())
    }

    fn arm_write(&self, controller: &IoController) -> std::io::Result<()> {
        self.log
            .borrow_mut()
            .push((controller.handle(), Direction::Write));
        Ok(())
    }

    fn disarm(&self, _controller: &IoController, _direction: Direction) -> std::io::Result<()> {
        Ok(())
    }
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

fn noop_waker() -> Waker {
    Waker::from(Arc::new(NoopWake))
}

/// Poll one future to completion. The in-memory pipes never wait on
/// external events once their bytes are in place, so a bounded number of
/// polls either finishes or the test is wrong.
fn drive_one<F: Future + Unpin>(mut fut: F) -> F::Output {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    for _ in 0..10_000 {
        if let Poll::Ready(value) = Pin::new(&mut fut).poll(&mut cx) {
            return value;
        }
    }
    panic!("future did not complete");
}

/// Poll two futures alternately until both complete; each poll consumes
/// what the peer produced, which is how the handshake converges.
fn drive_pair<A, B>(mut a: A, mut b: B) -> (A::Output, B::Output)
where
    A: Future + Unpin,
    B: Future + Unpin,
{
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut ra = None;
    let mut rb = None;
    for _ in 0..10_000 {
        if ra.is_none() {
            if let Poll::Ready(value) = Pin::new(&mut a).poll(&mut cx) {
                ra = Some(value);
            }
        }
        if rb.is_none() {
            if let Poll::Ready(value) = Pin::new(&mut b).poll(&mut cx) {
                rb = Some(value);
            }
        }
        if ra.is_some() && rb.is_some() {
            return (ra.unwrap(), rb.unwrap());
        }
    }
    panic!("futures did not converge");
}

fn config_pair(client_verify: VerifyMode) -> (TlsConfig, TlsConfig) {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let chain = CertificateChain::from_pem(generated.cert.pem().as_bytes()).unwrap();
    let cert = chain.clone().into_iter().next().unwrap();
    let key = PrivateKey::from_pem(generated.key_pair.serialize_pem().as_bytes()).unwrap();

    let server = TlsConfig::server(chain, key).build().unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(&cert).unwrap();
    let client = TlsConfig::client()
        .verify_mode(client_verify)
        .root_certs(roots)
        .build()
        .unwrap();
    (client, server)
}

struct Pair {
    client: TlsSocket<PipeEnd>,
    server: TlsSocket<PipeEnd>,
    reactor: Rc<TestReactor>,
    client_rx: Rc<RefCell<Wire>>,
    client_tx: Rc<RefCell<Wire>>,
    client_choke: Rc<Cell<usize>>,
}

fn socket_pair(send_cap: usize, client_verify: VerifyMode) -> Pair {
    let (client_cfg, server_cfg) = config_pair(client_verify);
    let reactor = Rc::new(TestReactor::default());
    let wires = duplex(send_cap);

    let client_ctrl = IoController::new(1, reactor.clone());
    let server_ctrl = IoController::new(2, reactor.clone());

    let mut client = TlsSocket::new(client_cfg, wires.client_io, client_ctrl);
    client.set_hostname("localhost").unwrap();
    let server = TlsSocket::new(server_cfg, wires.server_io, server_ctrl);

    Pair {
        client,
        server,
        reactor,
        client_rx: wires.client_rx,
        client_tx: wires.client_tx,
        client_choke: wires.client_choke,
    }
}

fn handshaken_pair(send_cap: usize) -> Pair {
    let mut pair = socket_pair(send_cap, VerifyMode::None);
    let (c, s) = drive_pair(pair.client.handshake(), pair.server.handshake());
    c.unwrap();
    s.unwrap();
    pair
}

fn recv_exact(sock: &mut TlsSocket<PipeEnd>, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; len.clamp(1, 64 * 1024)];
    while out.len() < len {
        let n = drive_one(sock.recv(&mut buf)).unwrap();
        assert!(n > 0, "unexpected end of stream after {} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn assert_quiescent(sock: &TlsSocket<PipeEnd>) {
    let controller = sock.controller();
    assert!(!controller.has_pending(Direction::Read));
    assert!(!controller.has_pending(Direction::Write));
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn tiny_request_echo() {
    let mut pair = handshaken_pair(usize::MAX);

    assert_eq!(drive_one(pair.client.send(b"ping")).unwrap(), 4);
    let request = recv_exact(&mut pair.server, 4);
    assert_eq!(request, b"ping");

    assert_eq!(drive_one(pair.server.send(&request)).unwrap(), 4);
    let reply = recv_exact(&mut pair.client, 4);
    assert_eq!(reply, b"ping");

    assert_quiescent(&pair.client);
    assert_quiescent(&pair.server);
}

#[test]
fn short_payload_saturation() {
    let mut pair = handshaken_pair(usize::MAX);
    let request = [0xabu8; 47];

    for _ in 0..200 {
        assert_eq!(drive_one(pair.client.send(&request)).unwrap(), 47);
        let seen = recv_exact(&mut pair.server, 47);
        assert_eq!(seen.as_slice(), &request);

        assert_eq!(drive_one(pair.server.send(&seen)).unwrap(), 47);
        let reply = recv_exact(&mut pair.client, 47);
        assert_eq!(reply.as_slice(), &request);
    }

    assert_quiescent(&pair.client);
    assert_quiescent(&pair.server);
}

#[test]
fn large_payload_across_many_records() {
    // A small write cap forces many partial kernel writes on both sides.
    let mut pair = handshaken_pair(11_000);
    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();

    assert_eq!(
        drive_one(pair.client.send(&payload)).unwrap(),
        payload.len()
    );
    let seen = recv_exact(&mut pair.server, payload.len());
    assert_eq!(seen, payload);

    assert_eq!(drive_one(pair.server.send(&seen)).unwrap(), payload.len());
    let echoed = recv_exact(&mut pair.client, payload.len());
    assert_eq!(echoed, payload);

    assert_quiescent(&pair.client);
    assert_quiescent(&pair.server);
}

#[test]
fn peer_half_close_reads_empty_and_send_fails() {
    let mut pair = handshaken_pair(usize::MAX);

    // The peer vanishes without a close-notify: its end of both wires
    // closes.
    pair.client_rx.borrow_mut().closed = true;
    pair.client_tx.borrow_mut().closed = true;
    drop(pair.server);

    let mut buf = [0u8; 64];
    assert_eq!(drive_one(pair.client.recv(&mut buf)).unwrap(), 0);
    // End-of-stream is sticky.
    assert_eq!(drive_one(pair.client.recv(&mut buf)).unwrap(), 0);

    match drive_one(pair.client.send(b"hello")) {
        Err(TlsError::PeerClosed | TlsError::WriteFailed(_)) => {}
        other => panic!("unexpected send outcome {other:?}"),
    }
    assert_quiescent(&pair.client);
}

#[test]
fn malformed_server_hello_fails_the_handshake() {
    let mut pair = socket_pair(usize::MAX, VerifyMode::None);

    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    let mut handshake = pair.client.handshake();
    // First poll sends the client hello and waits for the reply.
    assert!(Pin::new(&mut handshake).poll(&mut cx).is_pending());

    // The "server" answers with noise instead of a ServerHello.
    pair.client_rx
        .borrow_mut()
        .data
        .extend([0x15, 0x0b, 0xad, 0xc0, 0xde, 0x00, 0xff, 0x13, 0x37]);

    match Pin::new(&mut handshake).poll(&mut cx) {
        Poll::Ready(Err(TlsError::HandshakeFailed(_))) => {}
        other => panic!("unexpected handshake outcome {other:?}"),
    }
    drop(handshake);

    // No registration survives the failure; the socket can be closed.
    assert_quiescent(&pair.client);
    pair.client.close();
}

#[test]
fn post_handshake_tickets_do_not_corrupt_the_first_read() {
    // The server completes first and immediately queues NewSessionTicket
    // messages; they reach the client interleaved before any application
    // data.
    let mut pair = handshaken_pair(usize::MAX);

    assert_eq!(drive_one(pair.server.send(b"welcome")).unwrap(), 7);
    let first = recv_exact(&mut pair.client, 7);
    assert_eq!(first, b"welcome");

    assert_eq!(
        pair.client.protocol_version(),
        Some(rustls::ProtocolVersion::TLSv1_3)
    );
}

#[test]
fn handshake_with_verified_peer() {
    let mut pair = socket_pair(usize::MAX, VerifyMode::Peer);
    let (c, s) = drive_pair(pair.client.handshake(), pair.server.handshake());
    c.unwrap();
    s.unwrap();

    assert!(pair.client.is_handshake_complete());
    assert!(pair.client.peer_certificates().is_some());
    assert_eq!(pair.server.sni_hostname(), Some("localhost"));
}

#[test]
fn choked_handshake_arms_write_interest() {
    let mut pair = socket_pair(usize::MAX, VerifyMode::None);
    pair.client_choke.set(1);

    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    let mut client_hs = pair.client.handshake();
    // The client hello cannot go out: the operation must wait for
    // writability, not readability.
    assert!(Pin::new(&mut client_hs).poll(&mut cx).is_pending());
    assert_eq!(
        pair.reactor.log.borrow().last(),
        Some(&(1, Direction::Write))
    );

    let (c, s) = drive_pair(client_hs, pair.server.handshake());
    c.unwrap();
    s.unwrap();

    // Over its lifetime the handshake used both directions.
    let log = pair.reactor.log.borrow();
    assert!(log.contains(&(1, Direction::Write)));
    assert!(log.contains(&(1, Direction::Read)));
}

#[test]
fn cancelled_recv_leaves_no_registration() {
    let mut pair = handshaken_pair(usize::MAX);

    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    let mut buf = [0u8; 64];
    {
        let mut recv = pair.client.recv(&mut buf);
        assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
        let last_arm = pair.reactor.log.borrow().last().copied();
        assert_eq!(last_arm, Some((1, Direction::Read)));
        // Dropped mid-wait: the cancellation contract.
    }

    assert_quiescent(&pair.client);
}

#[test]
fn shutdown_is_graceful_and_idempotent() {
    let mut pair = handshaken_pair(usize::MAX);

    let (c, s) = drive_pair(pair.client.shutdown(), pair.server.shutdown());
    c.unwrap();
    s.unwrap();

    // A second shutdown is immediately Ok.
    drive_one(pair.client.shutdown()).unwrap();

    // After the close-notify exchange every receive reports end-of-stream.
    let mut buf = [0u8; 16];
    assert_eq!(drive_one(pair.client.recv(&mut buf)).unwrap(), 0);

    assert_quiescent(&pair.client);
    assert_quiescent(&pair.server);

    // Close after shutdown is always fine.
    pair.client.close();
    pair.server.close();
}

#[test]
fn client_operations_without_hostname_are_rejected() {
    // A client-role socket needs a hostname before its engine can exist;
    // the first operation that needs the engine reports the problem.
    let (client_cfg, _) = config_pair(VerifyMode::None);
    let wires = duplex(usize::MAX);
    let controller = IoController::new(10, Rc::new(TestReactor::default()));

    let mut sock = TlsSocket::new(client_cfg, wires.client_io, controller);
    match drive_one(sock.send(b"data")) {
        Err(TlsError::SniFailed(_)) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
}
