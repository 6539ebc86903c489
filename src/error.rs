//! Error types.

use std::fmt;
use std::io;
use std::time::Duration;

/// Error type for TLS configuration and transport operations.
///
/// Configuration errors are reported by the operation that caused them and
/// never deferred. Transient engine states (want-read / want-write) are not
/// errors from the caller's point of view; the `HandshakeWantRead` /
/// `HandshakeWantWrite` variants exist only for code that drives
/// [`TlsEngine`](crate::engine::TlsEngine) directly, outside the awaitables.
#[derive(Debug)]
pub enum TlsError {
    /// TLS configuration or per-connection state could not be created.
    ContextCreationFailed(String),
    /// Certificate could not be loaded or parsed.
    CertLoadFailed(String),
    /// Private key could not be loaded or parsed.
    KeyLoadFailed(String),
    /// Private key does not match the certificate.
    KeyMismatch(String),
    /// Trusted root (CA) material could not be loaded.
    CaLoadFailed(String),
    /// The TLS handshake failed.
    HandshakeFailed(Cause),
    /// The handshake needs more inbound ciphertext to make progress.
    HandshakeWantRead,
    /// The handshake needs pending outbound ciphertext drained.
    HandshakeWantWrite,
    /// A read operation failed.
    ReadFailed(Cause),
    /// A write operation failed.
    WriteFailed(Cause),
    /// The close-notify exchange failed.
    ShutdownFailed(Cause),
    /// The peer closed the connection.
    PeerClosed,
    /// Peer certificate verification failed.
    VerificationFailed(rustls::Error),
    /// The SNI hostname is not a valid server name.
    SniFailed(String),
    /// ALPN negotiation did not produce an acceptable protocol.
    AlpnFailed {
        /// Acceptable protocols, in preference order.
        expected: Vec<Vec<u8>>,
        /// Protocol the peer negotiated, if any.
        negotiated: Option<Vec<u8>>,
    },
    /// The operation timed out (produced by embedding schedulers that wrap
    /// the awaitables in a timeout).
    Timeout(Duration),
    /// An error that fits no other category.
    Unknown(String),
}

/// Lower-level cause attached to an I/O-path failure.
#[derive(Debug)]
pub enum Cause {
    /// The TLS library rejected the operation.
    Tls(rustls::Error),
    /// The underlying transport failed.
    Io(io::Error),
    /// The kernel reported the connection gone mid-operation.
    Disconnected,
    /// The kernel accepted a write of zero bytes; the transport is not
    /// making progress.
    Stalled,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Disconnected => write!(f, "connection reset by peer"),
            Self::Stalled => write!(f, "zero-length kernel write"),
        }
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextCreationFailed(msg) => write!(f, "TLS context creation failed: {msg}"),
            Self::CertLoadFailed(msg) => write!(f, "certificate load failed: {msg}"),
            Self::KeyLoadFailed(msg) => write!(f, "private key load failed: {msg}"),
            Self::KeyMismatch(msg) => write!(f, "private key does not match certificate: {msg}"),
            Self::CaLoadFailed(msg) => write!(f, "CA load failed: {msg}"),
            Self::HandshakeFailed(cause) => write!(f, "TLS handshake failed: {cause}"),
            Self::HandshakeWantRead => write!(f, "handshake needs more inbound ciphertext"),
            Self::HandshakeWantWrite => write!(f, "handshake needs outbound ciphertext drained"),
            Self::ReadFailed(cause) => write!(f, "TLS read failed: {cause}"),
            Self::WriteFailed(cause) => write!(f, "TLS write failed: {cause}"),
            Self::ShutdownFailed(cause) => write!(f, "TLS shutdown failed: {cause}"),
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::VerificationFailed(err) => write!(f, "peer verification failed: {err}"),
            Self::SniFailed(name) => write!(f, "invalid SNI hostname: {name}"),
            Self::AlpnFailed {
                expected,
                negotiated,
            } => write!(
                f,
                "ALPN negotiation failed: expected one of {expected:?}, negotiated {negotiated:?}"
            ),
            Self::Timeout(duration) => write!(f, "TLS operation timed out after {duration:?}"),
            Self::Unknown(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::HandshakeFailed(cause)
            | Self::ReadFailed(cause)
            | Self::WriteFailed(cause)
            | Self::ShutdownFailed(cause) => match cause {
                Cause::Tls(err) => Some(err),
                Cause::Io(err) => Some(err),
                Cause::Disconnected | Cause::Stalled => None,
            },
            Self::VerificationFailed(err) => Some(err),
            _ => None,
        }
    }
}

/// Classification of a non-blocking transport error.
///
/// This is the contract the reactor's raw I/O must honor: `NotReady` is
/// internal and always translated into readiness arming, `Disconnected`
/// means the kernel reported the peer gone, and `Fatal` is everything else.
#[derive(Debug)]
pub enum RawIoError {
    /// The operation would block; arm interest and retry on readiness.
    NotReady,
    /// The kernel reported the connection gone (reset, aborted, broken
    /// pipe).
    Disconnected,
    /// An unrecoverable transport error.
    Fatal(io::Error),
}

impl fmt::Display for RawIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "operation would block"),
            Self::Disconnected => write!(f, "connection reset by peer"),
            Self::Fatal(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl std::error::Error for RawIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fatal(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_covers_io_path_variants() {
        let err = TlsError::ReadFailed(Cause::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(err.to_string().contains("TLS read failed"));

        let err = TlsError::WriteFailed(Cause::Stalled);
        assert!(err.to_string().contains("zero-length"));
    }

    #[test]
    fn source_exposes_underlying_errors() {
        use std::error::Error as _;

        let err = TlsError::HandshakeFailed(Cause::Tls(rustls::Error::HandshakeNotComplete));
        assert!(err.source().is_some());

        assert!(TlsError::PeerClosed.source().is_none());
    }

    #[test]
    fn alpn_failure_reports_both_sides() {
        let err = TlsError::AlpnFailed {
            expected: vec![b"h2".to_vec()],
            negotiated: None,
        };
        let text = err.to_string();
        assert!(text.contains("h2"));
        assert!(text.contains("None"));
    }
}
