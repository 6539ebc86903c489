//! Tlsbridge: asynchronous TLS sockets over an external non-blocking reactor.
//!
//! # Overview
//!
//! This crate glues a synchronous, memory-buffered TLS engine (rustls driven
//! entirely through in-memory ciphertext queues) onto a cooperative I/O
//! scheduler. The scheduler itself (epoll, kqueue, io_uring, or a test
//! harness) stays outside the crate; it plugs in through two small traits,
//! [`Reactor`] (readiness interest) and [`RawIo`] (non-blocking byte I/O).
//!
//! A connection is a [`TlsSocket`]. Its four operations, `handshake`,
//! `recv`, `send` and `shutdown`, return futures that:
//!
//! 1. attempt the TLS operation synchronously on first poll,
//! 2. translate the engine's want-states into readiness interest
//!    (a TLS *read* that must flush pending ciphertext arms *write*
//!    interest, and vice versa),
//! 3. on wake-up drain the kernel socket until it reports not-ready
//!    (required for edge-triggered reactors), re-driving the engine after
//!    every byte exchange,
//! 4. clear all registered interest before their result becomes observable.
//!
//! # Module Structure
//!
//! - [`config`]: shared, immutable TLS configuration handles and builders
//! - [`identity`]: certificate / private key / root store types
//! - [`engine`]: the memory-queue TLS engine around rustls
//! - [`reactor`]: the readiness-interest trait the event loop implements
//! - [`controller`]: per-connection registration with at most one pending
//!   task per direction
//! - [`raw`]: the non-blocking byte I/O trait and error classification
//! - [`ops`]: the four awaitable state machines
//! - [`socket`]: the `TlsSocket` façade plus TCP listener/connect plumbing
//! - [`error`]: error types
//!
//! # Threading
//!
//! A socket and everything hanging off it is pinned to one scheduler
//! thread. There are no locks in the crate; the only `Send + Sync` piece is
//! the configuration handle, which many connections share.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ops;
pub mod raw;
pub mod reactor;
pub mod socket;
pub mod tracing_compat;

mod scratch;

pub use config::{
    ClientConfigBuilder, Role, ServerConfigBuilder, SessionCacheMode, TlsConfig, VerifyMode,
};
pub use controller::IoController;
pub use engine::{EngineStatus, HandshakePhase, TlsEngine};
pub use error::{Cause, RawIoError, TlsError};
pub use identity::{Certificate, CertificateChain, PrivateKey, RootCertStore};
pub use raw::RawIo;
pub use reactor::{Direction, Reactor, Readiness};
pub use socket::{TlsListener, TlsSocket};
