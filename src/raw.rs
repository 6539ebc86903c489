//! Non-blocking byte-level I/O.
//!
//! The core never issues socket syscalls of its own; it goes through
//! [`RawIo`], which the reactor integration provides. The trait's error
//! classification is the whole contract: `NotReady` drives readiness
//! arming, `Disconnected` is the kernel saying the peer is gone, `Fatal`
//! is everything else.
//!
//! An implementation for non-blocking [`std::net::TcpStream`] is provided;
//! reactors with their own socket types (or io_uring completions) supply
//! their own.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::error::RawIoError;

/// Non-blocking read/write on a transport.
pub trait RawIo {
    /// Read into `buf`.
    ///
    /// `Ok(0)` means the peer reached end-of-file; `Ok(n)` with `n > 0` is
    /// data. `NotReady` means nothing is available right now.
    fn raw_recv(&mut self, buf: &mut [u8]) -> Result<usize, RawIoError>;

    /// Write from `buf`.
    ///
    /// Partial writes are normal; `Ok(0)` on a non-empty buffer indicates
    /// a transport that is not making progress and is surfaced to the
    /// caller rather than retried.
    fn raw_send(&mut self, buf: &[u8]) -> Result<usize, RawIoError>;
}

/// Classify an `io::Error` into the raw I/O contract.
#[must_use]
pub fn classify_io_error(err: io::Error) -> RawIoError {
    match err.kind() {
        io::ErrorKind::WouldBlock => RawIoError::NotReady,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => RawIoError::Disconnected,
        _ => RawIoError::Fatal(err),
    }
}

impl RawIo for TcpStream {
    fn raw_recv(&mut self, buf: &mut [u8]) -> Result<usize, RawIoError> {
        loop {
            match Read::read(self, buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify_io_error(err)),
            }
        }
    }

    fn raw_send(&mut self, buf: &[u8]) -> Result<usize, RawIoError> {
        loop {
            match Write::write(self, buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify_io_error(err)),
            }
        }
    }
}
