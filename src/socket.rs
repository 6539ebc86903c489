//! The socket façade.
//!
//! [`TlsSocket`] owns the transport, the per-connection reactor
//! registration, and the (lazily created) TLS engine, and hands out the
//! four awaitables. [`TlsListener`] covers the accepting side: it yields
//! raw TCP streams that the caller wraps into server-role sockets and
//! handshakes.
//!
//! A typical client:
//!
//! ```ignore
//! let mut sock = TlsSocket::connect(addr, config, reactor)?;
//! sock.set_hostname("example.com")?;
//! sock.wait_connected().await?;
//! sock.handshake().await?;
//! sock.send(b"ping").await?;
//! let n = sock.recv(&mut buf).await?;
//! sock.shutdown().await?;
//! sock.close();
//! ```

use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::TlsConfig;
use crate::controller::IoController;
use crate::engine::TlsEngine;
use crate::error::TlsError;
use crate::ops::{Handshake, Recv, Send, Shutdown};
use crate::raw::RawIo;
use crate::reactor::{Direction, Reactor};
use crate::scratch::Scratch;

/// An asynchronous TLS connection over an arbitrary transport.
///
/// Movable, not clonable. The TLS engine is created on the first
/// [`handshake`](Self::handshake) (or the first operation that needs it),
/// exactly once. Dropping the socket releases its buffers but performs no
/// TLS shutdown; [`close`](Self::close) drops the transport without
/// running a shutdown either. The close-notify exchange is only ever done
/// by [`shutdown`](Self::shutdown).
pub struct TlsSocket<T: RawIo> {
    pub(crate) io: T,
    pub(crate) controller: Rc<IoController>,
    pub(crate) config: TlsConfig,
    pub(crate) engine: Option<TlsEngine>,
    pub(crate) hostname: Option<String>,
    pub(crate) scratch: Scratch,
}

impl<T: RawIo> TlsSocket<T> {
    /// Wrap an established transport.
    ///
    /// The role comes from the configuration: a client-role configuration
    /// additionally needs [`set_hostname`](Self::set_hostname) before the
    /// handshake.
    #[must_use]
    pub fn new(config: TlsConfig, io: T, controller: Rc<IoController>) -> Self {
        Self {
            io,
            controller,
            config,
            engine: None,
            hostname: None,
            scratch: Scratch::new(),
        }
    }

    /// Set the SNI hostname (client role). Also the name the peer
    /// certificate is verified against.
    pub fn set_hostname(&mut self, name: &str) -> Result<(), TlsError> {
        rustls::pki_types::ServerName::try_from(name.to_string())
            .map_err(|_| TlsError::SniFailed(name.to_string()))?;
        self.hostname = Some(name.to_string());
        Ok(())
    }

    /// Drive the TLS handshake.
    pub fn handshake(&mut self) -> Handshake<'_, T> {
        Handshake {
            sock: self,
            armed: None,
        }
    }

    /// Receive decrypted plaintext into `buf`.
    pub fn recv<'a>(&'a mut self, buf: &'a mut [u8]) -> Recv<'a, T> {
        Recv {
            sock: self,
            buf,
            armed: None,
        }
    }

    /// Send the whole of `buf` as plaintext.
    pub fn send<'a>(&'a mut self, buf: &'a [u8]) -> Send<'a, T> {
        Send {
            sock: self,
            buf,
            plain_offset: 0,
            armed: None,
        }
    }

    /// Run the close-notify exchange. Always resolves `Ok(())`.
    pub fn shutdown(&mut self) -> Shutdown<'_, T> {
        Shutdown {
            sock: self,
            armed: None,
        }
    }

    /// Release the reactor registration and drop the transport.
    ///
    /// No TLS shutdown is performed; run [`shutdown`](Self::shutdown)
    /// first for a graceful close. Calling this after `shutdown` is always
    /// fine.
    pub fn close(self) {
        self.controller.disarm(Direction::Read);
        self.controller.disarm(Direction::Write);
        drop(self.io);
    }

    /// Whether the handshake has completed successfully.
    #[must_use]
    pub fn is_handshake_complete(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(TlsEngine::is_handshake_complete)
    }

    /// Negotiated protocol version, once the handshake is done.
    #[must_use]
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.engine.as_ref().and_then(TlsEngine::protocol_version)
    }

    /// Negotiated ALPN protocol, if any.
    #[must_use]
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.engine.as_ref().and_then(TlsEngine::alpn_protocol)
    }

    /// Negotiated cipher suite, once the handshake is done.
    #[must_use]
    pub fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        self.engine
            .as_ref()
            .and_then(TlsEngine::negotiated_cipher_suite)
    }

    /// Certificate chain presented by the peer, if any.
    #[must_use]
    pub fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        self.engine.as_ref().and_then(TlsEngine::peer_certificates)
    }

    /// SNI hostname the client sent (server role).
    #[must_use]
    pub fn sni_hostname(&self) -> Option<&str> {
        self.engine.as_ref().and_then(TlsEngine::sni_hostname)
    }

    /// The controller registering this socket with the reactor.
    #[must_use]
    pub fn controller(&self) -> Rc<IoController> {
        Rc::clone(&self.controller)
    }

    /// Shared reference to the transport.
    #[must_use]
    pub fn get_ref(&self) -> &T {
        &self.io
    }

    /// Mutable reference to the transport.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// Consume the socket, returning the transport (discards TLS state).
    #[must_use]
    pub fn into_inner(self) -> T {
        self.io
    }

    // Create the engine if it does not exist yet. Only the first call does
    // work; configuration problems surface here, from the first operation
    // that needed the engine.
    pub(crate) fn ensure_engine(&mut self) -> Result<(), TlsError> {
        if self.engine.is_none() {
            self.engine = Some(TlsEngine::for_role(&self.config, self.hostname.as_deref())?);
        }
        Ok(())
    }

    pub(crate) fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    // Post-handshake policy checks; currently ALPN enforcement.
    pub(crate) fn check_negotiation(&self) -> Result<(), TlsError> {
        if !self.config.alpn_required() {
            return Ok(());
        }
        let negotiated = self
            .engine
            .as_ref()
            .and_then(TlsEngine::alpn_protocol)
            .map(<[u8]>::to_vec);
        let acceptable = match negotiated.as_deref() {
            Some(protocol) => self
                .config
                .alpn_protocols()
                .iter()
                .any(|p| p.as_slice() == protocol),
            None => false,
        };
        if acceptable {
            Ok(())
        } else {
            Err(TlsError::AlpnFailed {
                expected: self.config.alpn_protocols().to_vec(),
                negotiated,
            })
        }
    }

    #[cfg(test)]
    pub(crate) fn engine_mut_for_test(&mut self) -> &mut TlsEngine {
        self.engine.as_mut().expect("engine not initialized")
    }
}

impl<T: RawIo + std::fmt::Debug> std::fmt::Debug for TlsSocket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("io", &self.io)
            .field("role", &self.config.role())
            .field("handshaken", &self.is_handshake_complete())
            .finish_non_exhaustive()
    }
}

impl TlsSocket<TcpStream> {
    /// Start a non-blocking TCP connect towards `addr`.
    ///
    /// The returned socket is not yet connected: await
    /// [`wait_connected`](Self::wait_connected), then set the hostname and
    /// run the handshake.
    pub fn connect(
        addr: SocketAddr,
        config: TlsConfig,
        reactor: Rc<dyn Reactor>,
    ) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => return Err(err),
        }

        let stream: TcpStream = socket.into();
        let controller = IoController::new(stream.as_raw_fd(), reactor);
        Ok(Self::new(config, stream, controller))
    }

    /// Resolve once the TCP connection is established (or failed).
    pub fn wait_connected(&mut self) -> Connect<'_> {
        Connect {
            sock: self,
            armed: false,
        }
    }
}

#[cfg(unix)]
fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Future resolving when a non-blocking TCP connect finishes.
///
/// Created by [`TlsSocket::wait_connected`].
pub struct Connect<'a> {
    sock: &'a mut TlsSocket<TcpStream>,
    armed: bool,
}

impl Future for Connect<'_> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // A queued SO_ERROR settles the outcome.
        match this.sock.io.take_error() {
            Ok(None) => {}
            Ok(Some(err)) => {
                this.finish();
                return Poll::Ready(Err(err));
            }
            Err(err) => {
                this.finish();
                return Poll::Ready(Err(err));
            }
        }

        match this.sock.io.peer_addr() {
            Ok(_) => {
                this.finish();
                Poll::Ready(Ok(()))
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                if let Err(err) = this.sock.controller.arm(Direction::Write, cx.waker()) {
                    this.finish();
                    return Poll::Ready(Err(err));
                }
                this.armed = true;
                Poll::Pending
            }
            Err(err) => {
                this.finish();
                Poll::Ready(Err(err))
            }
        }
    }
}

impl Connect<'_> {
    fn finish(&mut self) {
        self.sock.controller.disarm(Direction::Write);
        self.armed = false;
    }
}

impl Drop for Connect<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.sock.controller.disarm(Direction::Write);
        }
    }
}

/// A listening TCP socket producing raw streams for TLS serving.
///
/// Accepted streams are non-blocking; wrap each into a server-role
/// [`TlsSocket`] and await its handshake.
pub struct TlsListener {
    inner: TcpListener,
    controller: Rc<IoController>,
    config: TlsConfig,
    reactor: Rc<dyn Reactor>,
}

impl TlsListener {
    /// Bind to `addr` (with `SO_REUSEADDR`) and start listening.
    pub fn bind(
        addr: SocketAddr,
        config: TlsConfig,
        reactor: Rc<dyn Reactor>,
        backlog: i32,
    ) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let inner: TcpListener = socket.into();
        let controller = IoController::new(inner.as_raw_fd(), Rc::clone(&reactor));
        Ok(Self {
            inner,
            controller,
            config,
            reactor,
        })
    }

    /// Accept one connection.
    pub fn accept(&mut self) -> Accept<'_> {
        Accept {
            listener: self,
            armed: false,
        }
    }

    /// Wrap an accepted stream into a server-role socket registered with
    /// this listener's reactor.
    #[must_use]
    pub fn server_socket(&self, stream: TcpStream) -> TlsSocket<TcpStream> {
        let controller = IoController::new(stream.as_raw_fd(), Rc::clone(&self.reactor));
        TlsSocket::new(self.config.clone(), stream, controller)
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// The controller registering this listener with the reactor.
    #[must_use]
    pub fn controller(&self) -> Rc<IoController> {
        Rc::clone(&self.controller)
    }

    /// Release the reactor registration and close the listening socket.
    pub fn close(self) {
        self.controller.disarm(Direction::Read);
        drop(self.inner);
    }
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("local_addr", &self.inner.local_addr().ok())
            .finish_non_exhaustive()
    }
}

/// Future resolving to one accepted connection.
///
/// Created by [`TlsListener::accept`]. The accepted stream is switched to
/// non-blocking mode (plus `TCP_NODELAY`) before it is returned.
pub struct Accept<'a> {
    listener: &'a mut TlsListener,
    armed: bool,
}

impl Future for Accept<'_> {
    type Output = io::Result<(TcpStream, SocketAddr)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match this.listener.inner.accept() {
                Ok((stream, addr)) => {
                    this.finish();
                    let prepared = stream
                        .set_nonblocking(true)
                        .and_then(|()| stream.set_nodelay(true));
                    return Poll::Ready(prepared.map(|()| (stream, addr)));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(err) = this.listener.controller.arm(Direction::Read, cx.waker()) {
                        this.finish();
                        return Poll::Ready(Err(err));
                    }
                    this.armed = true;
                    return Poll::Pending;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    this.finish();
                    return Poll::Ready(Err(err));
                }
            }
        }
    }
}

impl Accept<'_> {
    fn finish(&mut self) {
        self.listener.controller.disarm(Direction::Read);
        self.armed = false;
    }
}

impl Drop for Accept<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.listener.controller.disarm(Direction::Read);
        }
    }
}
