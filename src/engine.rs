//! The memory-queue TLS engine.
//!
//! [`TlsEngine`] wraps a rustls connection together with two byte queues it
//! owns: inbound ciphertext (appended from the network, consumed by the
//! connection) and outbound ciphertext (produced by the connection, drained
//! to the network). The engine never touches a socket; all byte movement is
//! the caller's job, which keeps the TLS state machine reactor-agnostic and
//! testable without any I/O.
//!
//! Every operation reports [`EngineStatus`]: either progress, a want-state
//! naming the queue that blocks further progress, a clean peer close, or a
//! fatal error. Want-states are not errors; the awaitables translate them
//! into readiness interest.

use std::collections::VecDeque;
use std::io::{Read, Write};

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ProtocolVersion, ServerConnection};

use crate::config::{Role, TlsConfig};
use crate::error::TlsError;
use crate::tracing_compat::{debug, trace};

/// Outcome of a single engine operation.
#[derive(Debug)]
pub enum EngineStatus {
    /// The operation made progress. For `read`/`write` the payload is the
    /// plaintext byte count (`read` never reports `Success(0)`); for
    /// `do_handshake`/`shutdown` it is zero.
    Success(usize),
    /// More inbound ciphertext is required before progress is possible.
    WantRead,
    /// Pending outbound ciphertext must be drained before progress is
    /// possible.
    WantWrite,
    /// The peer closed the connection.
    ZeroReturn,
    /// The TLS session failed; the error is sticky.
    Fatal(rustls::Error),
}

/// Lifecycle state of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// `do_handshake` has not been called yet.
    NotStarted,
    /// The handshake is running.
    InProgress,
    /// The handshake finished successfully. Terminal.
    Completed,
    /// The handshake failed or the peer closed mid-handshake. Terminal.
    Failed,
}

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Session {
    fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
        match self {
            Self::Client(c) => c.read_tls(rd),
            Self::Server(s) => s.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn std::io::Write) -> std::io::Result<usize> {
        match self {
            Self::Client(c) => c.write_tls(wr),
            Self::Server(s) => s.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Self::Client(c) => c.process_new_packets(),
            Self::Server(s) => s.process_new_packets(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_read(),
            Self::Server(s) => s.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_write(),
            Self::Server(s) => s.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(c) => c.is_handshaking(),
            Self::Server(s) => s.is_handshaking(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Self::Client(c) => c.reader(),
            Self::Server(s) => s.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Self::Client(c) => c.writer(),
            Self::Server(s) => s.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Client(c) => c.send_close_notify(),
            Self::Server(s) => s.send_close_notify(),
        }
    }

    fn protocol_version(&self) -> Option<ProtocolVersion> {
        match self {
            Self::Client(c) => c.protocol_version(),
            Self::Server(s) => s.protocol_version(),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Self::Client(c) => c.alpn_protocol(),
            Self::Server(s) => s.alpn_protocol(),
        }
    }

    fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match self {
            Self::Client(c) => c.negotiated_cipher_suite(),
            Self::Server(s) => s.negotiated_cipher_suite(),
        }
    }

    fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        match self {
            Self::Client(c) => c.peer_certificates(),
            Self::Server(s) => s.peer_certificates(),
        }
    }

    fn sni_hostname(&self) -> Option<&str> {
        match self {
            Self::Client(_) => None,
            Self::Server(s) => s.server_name(),
        }
    }
}

/// Per-connection TLS state with in-memory ciphertext queues.
///
/// Exactly one task drives an engine at a time; there is no interior
/// synchronization.
pub struct TlsEngine {
    session: Session,
    inbound: VecDeque<u8>,
    outbound: VecDeque<u8>,
    phase: HandshakePhase,
    fatal: Option<rustls::Error>,
    peer_closed: bool,
    peer_eof: bool,
    close_notify_sent: bool,
}

impl TlsEngine {
    /// Create a client-role engine.
    ///
    /// `hostname` is sent as SNI and used for peer-name verification.
    pub fn client(config: &TlsConfig, hostname: &str) -> Result<Self, TlsError> {
        let client_config = config.client_config().ok_or_else(|| {
            TlsError::ContextCreationFailed("client engine requires a client configuration".into())
        })?;
        let name = ServerName::try_from(hostname.to_string())
            .map_err(|_| TlsError::SniFailed(hostname.to_string()))?;
        let conn = ClientConnection::new(std::sync::Arc::clone(client_config), name)
            .map_err(|e| TlsError::ContextCreationFailed(e.to_string()))?;
        Ok(Self::new(Session::Client(conn)))
    }

    /// Create a server-role engine.
    pub fn server(config: &TlsConfig) -> Result<Self, TlsError> {
        let server_config = config.server_config().ok_or_else(|| {
            TlsError::ContextCreationFailed("server engine requires a server configuration".into())
        })?;
        let conn = ServerConnection::new(std::sync::Arc::clone(server_config))
            .map_err(|e| TlsError::ContextCreationFailed(e.to_string()))?;
        Ok(Self::new(Session::Server(conn)))
    }

    /// Create an engine for the given role.
    pub fn for_role(config: &TlsConfig, hostname: Option<&str>) -> Result<Self, TlsError> {
        match config.role() {
            Role::Client => {
                let hostname = hostname.ok_or_else(|| {
                    TlsError::SniFailed("client engine requires a hostname".into())
                })?;
                Self::client(config, hostname)
            }
            Role::Server => Self::server(config),
        }
    }

    fn new(session: Session) -> Self {
        Self {
            session,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            phase: HandshakePhase::NotStarted,
            fatal: None,
            peer_closed: false,
            peer_eof: false,
            close_notify_sent: false,
        }
    }

    /// Append ciphertext received from the network to the inbound queue.
    ///
    /// Returns the number of bytes accepted (always the full slice; the
    /// queue grows as needed).
    pub fn feed_encrypted_input(&mut self, bytes: &[u8]) -> usize {
        self.inbound.extend(bytes);
        bytes.len()
    }

    /// Record that the network reported end-of-file from the peer.
    ///
    /// Without this, an empty inbound queue is indistinguishable from a
    /// peer that has not spoken yet.
    pub fn mark_peer_eof(&mut self) {
        if self.peer_eof {
            return;
        }
        self.peer_eof = true;
        let _ = self.session.read_tls(&mut std::io::empty());
        if let Ok(state) = self.session.process_new_packets() {
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
        }
    }

    /// Move pending ciphertext from the outbound queue into `buf`.
    ///
    /// Returns the number of bytes copied; zero means nothing is pending.
    pub fn extract_encrypted_output(&mut self, buf: &mut [u8]) -> usize {
        self.flush_session_output();
        let n = buf.len().min(self.outbound.len());
        for (dst, src) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *dst = src;
        }
        n
    }

    /// Bytes currently queued on the outbound side.
    pub fn pending_encrypted_output(&mut self) -> usize {
        self.flush_session_output();
        self.outbound.len()
    }

    /// Drive the handshake as far as the queues allow.
    pub fn do_handshake(&mut self) -> EngineStatus {
        match self.phase {
            HandshakePhase::Completed => return EngineStatus::Success(0),
            HandshakePhase::Failed => {
                return match &self.fatal {
                    Some(err) => EngineStatus::Fatal(err.clone()),
                    None => EngineStatus::ZeroReturn,
                };
            }
            HandshakePhase::NotStarted => self.phase = HandshakePhase::InProgress,
            HandshakePhase::InProgress => {}
        }

        if let Err(err) = self.pump_inbound() {
            self.phase = HandshakePhase::Failed;
            return EngineStatus::Fatal(err);
        }
        self.flush_session_output();

        if !self.session.is_handshaking() {
            self.phase = HandshakePhase::Completed;
            debug!("handshake complete");
            return EngineStatus::Success(0);
        }
        if self.peer_eof {
            self.phase = HandshakePhase::Failed;
            return EngineStatus::ZeroReturn;
        }
        if self.session.wants_read() && self.inbound.is_empty() {
            return EngineStatus::WantRead;
        }
        if !self.outbound.is_empty() {
            return EngineStatus::WantWrite;
        }
        EngineStatus::WantRead
    }

    /// Read decrypted plaintext into `buf`.
    ///
    /// `Success(n)` always carries `n >= 1`; a clean peer close is reported
    /// as `ZeroReturn`. An unclean transport end (EOF without close-notify)
    /// is also reported as `ZeroReturn`, since the caller treats both as
    /// end-of-stream.
    pub fn read(&mut self, buf: &mut [u8]) -> EngineStatus {
        debug_assert!(!buf.is_empty());
        if let Some(err) = &self.fatal {
            return EngineStatus::Fatal(err.clone());
        }
        if let Err(err) = self.pump_inbound() {
            return EngineStatus::Fatal(err);
        }

        match self.session.reader().read(buf) {
            Ok(0) => EngineStatus::ZeroReturn,
            Ok(n) => {
                trace!(bytes = n, "plaintext read");
                EngineStatus::Success(n)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                self.flush_session_output();
                if !self.outbound.is_empty() {
                    // Pending records (key updates, handshake responses)
                    // must reach the peer before more plaintext can flow.
                    EngineStatus::WantWrite
                } else {
                    EngineStatus::WantRead
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => EngineStatus::ZeroReturn,
            Err(err) => EngineStatus::Fatal(rustls::Error::General(err.to_string())),
        }
    }

    /// Encrypt plaintext from `buf` into the outbound queue.
    ///
    /// Partial writes are legal: `Success(n)` with `n < buf.len()` means
    /// the session buffer filled up; drain the outbound queue and call
    /// again with the remainder.
    pub fn write(&mut self, buf: &[u8]) -> EngineStatus {
        if let Some(err) = &self.fatal {
            return EngineStatus::Fatal(err.clone());
        }
        if let Err(err) = self.pump_inbound() {
            return EngineStatus::Fatal(err);
        }

        let n = match self.session.writer().write(buf) {
            Ok(n) => n,
            Err(err) => return EngineStatus::Fatal(rustls::Error::General(err.to_string())),
        };
        self.flush_session_output();
        if n == 0 {
            // A full session buffer normally means ciphertext is pending.
            // Mid-handshake the buffered plaintext cannot become records
            // yet, so progress needs peer bytes instead.
            if self.outbound.is_empty() && self.session.is_handshaking() {
                EngineStatus::WantRead
            } else {
                EngineStatus::WantWrite
            }
        } else {
            trace!(bytes = n, "plaintext accepted");
            EngineStatus::Success(n)
        }
    }

    /// Drive the close-notify exchange.
    ///
    /// `Success` once our close-notify is queued and flushed into the
    /// outbound queue *and* the peer's close has been observed; otherwise
    /// the want-state naming the blocking queue.
    pub fn shutdown(&mut self) -> EngineStatus {
        if let Some(err) = &self.fatal {
            return EngineStatus::Fatal(err.clone());
        }
        if !self.close_notify_sent {
            self.session.send_close_notify();
            self.close_notify_sent = true;
            debug!("close-notify queued");
        }
        if let Err(err) = self.pump_inbound() {
            return EngineStatus::Fatal(err);
        }
        self.flush_session_output();

        if !self.outbound.is_empty() {
            return EngineStatus::WantWrite;
        }
        if self.peer_closed || self.peer_eof {
            EngineStatus::Success(0)
        } else {
            EngineStatus::WantRead
        }
    }

    /// Current handshake phase.
    #[must_use]
    pub fn handshake_phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Whether the handshake has completed successfully.
    #[must_use]
    pub fn is_handshake_complete(&self) -> bool {
        self.phase == HandshakePhase::Completed
    }

    /// Negotiated protocol version, once known.
    #[must_use]
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.session.protocol_version()
    }

    /// Negotiated ALPN protocol, if any.
    #[must_use]
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.session.alpn_protocol()
    }

    /// Negotiated cipher suite, once known.
    #[must_use]
    pub fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        self.session.negotiated_cipher_suite()
    }

    /// Certificate chain presented by the peer, if any.
    #[must_use]
    pub fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        self.session.peer_certificates()
    }

    /// SNI hostname the client sent (server role only).
    #[must_use]
    pub fn sni_hostname(&self) -> Option<&str> {
        self.session.sni_hostname()
    }

    // Feed queued inbound ciphertext through the session. The deframer can
    // refuse input when its buffer is full; processing between reads makes
    // room, and a second refusal ends the loop.
    fn pump_inbound(&mut self) -> Result<(), rustls::Error> {
        while !self.inbound.is_empty() {
            let n = self.session.read_tls(&mut self.inbound).unwrap_or(0);
            let state = self.session.process_new_packets().map_err(|err| {
                self.fatal = Some(err.clone());
                err
            })?;
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    // Move everything the session wants to send into the outbound queue.
    // Writing into the queue cannot fail or block.
    fn flush_session_output(&mut self) {
        while self.session.wants_write() {
            if self.session.write_tls(&mut self.outbound).unwrap_or(0) == 0 {
                break;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_outbound_for_test(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes);
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("phase", &self.phase)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .field("peer_closed", &self.peer_closed)
            .finish_non_exhaustive()
    }
}
