//! Shared TLS configuration handles.
//!
//! A [`TlsConfig`] is built once, sealed, and shared by any number of
//! connections; cloning the handle is an `Arc` bump. The two builders cover
//! the client and server roles. Configuration errors are reported by
//! `build()` and never deferred to the handshake.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::{NoServerSessionStorage, ServerSessionMemoryCache, WebPkiClientVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, ProtocolVersion, ServerConfig, SignatureScheme,
    SupportedCipherSuite,
};

use crate::error::TlsError;
use crate::identity::{CertificateChain, PrivateKey, RootCertStore};

/// Protocol role of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates connections and handshakes.
    Client,
    /// Accepts connections and handshakes.
    Server,
}

/// Peer verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Do not verify the peer.
    None,
    /// Verify the peer certificate when one is presented.
    #[default]
    Peer,
    /// Verify the peer certificate and fail if none is presented.
    RequirePeerCert,
    /// Verify the client certificate once per connection (server role; the
    /// protocol has no re-verification points, so this behaves like `Peer`).
    ClientOnce,
}

/// Session reuse policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCacheMode {
    /// No session reuse.
    Disabled,
    /// In-memory cache holding up to the given number of sessions.
    InMemory(usize),
}

impl Default for SessionCacheMode {
    fn default() -> Self {
        Self::InMemory(256)
    }
}

/// Immutable TLS configuration shared across connections.
#[derive(Clone)]
pub struct TlsConfig {
    inner: ConfigInner,
    alpn_required: bool,
}

#[derive(Clone)]
enum ConfigInner {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

impl TlsConfig {
    /// Start building a client configuration.
    #[must_use]
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Start building a server configuration from the server's certificate
    /// chain and private key.
    #[must_use]
    pub fn server(chain: CertificateChain, key: PrivateKey) -> ServerConfigBuilder {
        ServerConfigBuilder::new(chain, key)
    }

    /// The role this configuration was built for.
    #[must_use]
    pub fn role(&self) -> Role {
        match self.inner {
            ConfigInner::Client(_) => Role::Client,
            ConfigInner::Server(_) => Role::Server,
        }
    }

    /// Whether a handshake must end with a negotiated ALPN protocol.
    #[must_use]
    pub fn alpn_required(&self) -> bool {
        self.alpn_required
    }

    /// The configured ALPN protocols, in preference order.
    #[must_use]
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        match &self.inner {
            ConfigInner::Client(c) => &c.alpn_protocols,
            ConfigInner::Server(c) => &c.alpn_protocols,
        }
    }

    pub(crate) fn client_config(&self) -> Option<&Arc<ClientConfig>> {
        match &self.inner {
            ConfigInner::Client(c) => Some(c),
            ConfigInner::Server(_) => None,
        }
    }

    pub(crate) fn server_config(&self) -> Option<&Arc<ServerConfig>> {
        match &self.inner {
            ConfigInner::Server(c) => Some(c),
            ConfigInner::Client(_) => None,
        }
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

/// Builder for a client-role [`TlsConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    root_certs: RootCertStore,
    identity: Option<(CertificateChain, PrivateKey)>,
    verify_mode: VerifyMode,
    alpn_protocols: Vec<Vec<u8>>,
    alpn_required: bool,
    enable_sni: bool,
    min_version: Option<ProtocolVersion>,
    max_version: Option<ProtocolVersion>,
    cipher_suites: Vec<SupportedCipherSuite>,
    session_cache: SessionCacheMode,
}

impl ClientConfigBuilder {
    /// Create a builder with default settings: peer verification on, SNI
    /// on, no ALPN, in-memory session cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enable_sni: true,
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            root_certs: RootCertStore::empty(),
            identity: None,
            verify_mode: VerifyMode::default(),
            alpn_protocols: Vec::new(),
            alpn_required: false,
            enable_sni: false,
            min_version: None,
            max_version: None,
            cipher_suites: Vec::new(),
            session_cache: SessionCacheMode::default(),
        }
    }

    /// Use the given trusted roots for server verification.
    #[must_use]
    pub fn root_certs(mut self, roots: RootCertStore) -> Self {
        self.root_certs = roots;
        self
    }

    /// Add a single trusted root.
    #[must_use]
    pub fn add_root_certificate(mut self, cert: crate::identity::Certificate) -> Self {
        if let Err(e) = self.root_certs.add(&cert) {
            crate::tracing_compat::warn!(error = %e, "failed to add root certificate");
        }
        self
    }

    /// Set the client identity for mutual TLS.
    #[must_use]
    pub fn identity(mut self, chain: CertificateChain, key: PrivateKey) -> Self {
        self.identity = Some((chain, key));
        self
    }

    /// Set the peer verification policy.
    ///
    /// `Peer`, `RequirePeerCert` and `ClientOnce` are equivalent on the
    /// client side: the server identity is always verified unless the mode
    /// is `None`.
    #[must_use]
    pub fn verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    /// Set the ALPN protocols to offer, in preference order.
    #[must_use]
    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Fail the handshake unless one of the configured ALPN protocols is
    /// negotiated.
    #[must_use]
    pub fn require_alpn(mut self) -> Self {
        self.alpn_required = true;
        self
    }

    /// Disable SNI.
    #[must_use]
    pub fn disable_sni(mut self) -> Self {
        self.enable_sni = false;
        self
    }

    /// Clamp the minimum protocol version.
    #[must_use]
    pub fn min_version(mut self, version: ProtocolVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Clamp the maximum protocol version.
    #[must_use]
    pub fn max_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = Some(version);
        self
    }

    /// Restrict the cipher suites offered, in preference order.
    ///
    /// An empty list (the default) keeps the provider's full set. A list
    /// incompatible with the configured protocol versions is rejected by
    /// [`build`](Self::build).
    #[must_use]
    pub fn cipher_suites(mut self, suites: Vec<SupportedCipherSuite>) -> Self {
        self.cipher_suites = suites;
        self
    }

    /// Set the session reuse policy.
    #[must_use]
    pub fn session_cache(mut self, mode: SessionCacheMode) -> Self {
        self.session_cache = mode;
        self
    }

    /// Build the configuration handle.
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let provider = Arc::new(provider_with_suites(&self.cipher_suites));
        let versions = version_set(self.min_version, self.max_version);

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| TlsError::ContextCreationFailed(e.to_string()))?;

        let builder = match self.verify_mode {
            VerifyMode::None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification::new(provider))),
            _ => builder.with_root_certificates(self.root_certs.into_inner()),
        };

        let mut config = if let Some((chain, key)) = self.identity {
            builder
                .with_client_auth_cert(chain.into_inner(), key.clone_inner())
                .map_err(key_error)?
        } else {
            builder.with_no_client_auth()
        };

        config.alpn_protocols = self.alpn_protocols;
        config.enable_sni = self.enable_sni;
        config.resumption = match self.session_cache {
            SessionCacheMode::Disabled => Resumption::disabled(),
            SessionCacheMode::InMemory(n) => Resumption::in_memory_sessions(n),
        };

        Ok(TlsConfig {
            inner: ConfigInner::Client(Arc::new(config)),
            alpn_required: self.alpn_required,
        })
    }
}

/// Builder for a server-role [`TlsConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    cert_chain: CertificateChain,
    key: PrivateKey,
    client_auth: VerifyMode,
    client_roots: RootCertStore,
    alpn_protocols: Vec<Vec<u8>>,
    alpn_required: bool,
    min_version: Option<ProtocolVersion>,
    max_version: Option<ProtocolVersion>,
    cipher_suites: Vec<SupportedCipherSuite>,
    session_cache: SessionCacheMode,
    tls13_tickets: Option<usize>,
}

impl ServerConfigBuilder {
    /// Create a builder with the server's certificate chain and private
    /// key. Client authentication is off by default.
    #[must_use]
    pub fn new(chain: CertificateChain, key: PrivateKey) -> Self {
        Self {
            cert_chain: chain,
            key,
            client_auth: VerifyMode::None,
            client_roots: RootCertStore::empty(),
            alpn_protocols: Vec::new(),
            alpn_required: false,
            min_version: None,
            max_version: None,
            cipher_suites: Vec::new(),
            session_cache: SessionCacheMode::default(),
            tls13_tickets: None,
        }
    }

    /// Create a builder loading the identity from PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, TlsError> {
        let chain = CertificateChain::from_pem_file(cert_path)?;
        let key = PrivateKey::from_pem_file(key_path)?;
        Ok(Self::new(chain, key))
    }

    /// Set the client authentication policy and the roots used to verify
    /// client certificates.
    ///
    /// `Peer` and `ClientOnce` accept connections without a client
    /// certificate but verify one when presented; `RequirePeerCert` rejects
    /// certificate-less clients.
    #[must_use]
    pub fn client_auth(mut self, mode: VerifyMode, roots: RootCertStore) -> Self {
        self.client_auth = mode;
        self.client_roots = roots;
        self
    }

    /// Set the ALPN protocols the server selects from, in preference order.
    #[must_use]
    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Fail the handshake unless one of the configured ALPN protocols is
    /// negotiated.
    #[must_use]
    pub fn require_alpn(mut self) -> Self {
        self.alpn_required = true;
        self
    }

    /// Clamp the minimum protocol version.
    #[must_use]
    pub fn min_version(mut self, version: ProtocolVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Clamp the maximum protocol version.
    #[must_use]
    pub fn max_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = Some(version);
        self
    }

    /// Restrict the cipher suites accepted, in preference order.
    ///
    /// An empty list (the default) keeps the provider's full set. A list
    /// incompatible with the configured protocol versions is rejected by
    /// [`build`](Self::build).
    #[must_use]
    pub fn cipher_suites(mut self, suites: Vec<SupportedCipherSuite>) -> Self {
        self.cipher_suites = suites;
        self
    }

    /// Set the session reuse policy (TLS 1.2 session cache; disabling also
    /// turns off TLS 1.3 tickets).
    #[must_use]
    pub fn session_cache(mut self, mode: SessionCacheMode) -> Self {
        self.session_cache = mode;
        self
    }

    /// Number of TLS 1.3 session tickets to send after each handshake.
    #[must_use]
    pub fn tls13_tickets(mut self, count: usize) -> Self {
        self.tls13_tickets = Some(count);
        self
    }

    /// Build the configuration handle.
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let provider = Arc::new(provider_with_suites(&self.cipher_suites));
        let versions = version_set(self.min_version, self.max_version);

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| TlsError::ContextCreationFailed(e.to_string()))?;

        let builder = match self.client_auth {
            VerifyMode::None => builder.with_no_client_auth(),
            mode => {
                let roots = Arc::new(self.client_roots.into_inner());
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider);
                let verifier = if mode == VerifyMode::RequirePeerCert {
                    verifier
                } else {
                    verifier.allow_unauthenticated()
                };
                let verifier = verifier
                    .build()
                    .map_err(|e| TlsError::CaLoadFailed(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut config = builder
            .with_single_cert(self.cert_chain.into_inner(), self.key.clone_inner())
            .map_err(key_error)?;

        config.alpn_protocols = self.alpn_protocols;
        match self.session_cache {
            SessionCacheMode::Disabled => {
                config.session_storage = Arc::new(NoServerSessionStorage {});
                config.send_tls13_tickets = 0;
            }
            SessionCacheMode::InMemory(n) => {
                config.session_storage = ServerSessionMemoryCache::new(n.max(1));
            }
        }
        if let Some(count) = self.tls13_tickets {
            config.send_tls13_tickets = count;
        }

        Ok(TlsConfig {
            inner: ConfigInner::Server(Arc::new(config)),
            alpn_required: self.alpn_required,
        })
    }
}

fn key_error(err: rustls::Error) -> TlsError {
    match err {
        rustls::Error::InconsistentKeys(_) => TlsError::KeyMismatch(err.to_string()),
        _ => TlsError::ContextCreationFailed(err.to_string()),
    }
}

// The ring provider, with its suite list replaced when the builder
// restricted it. Version compatibility of the resulting set is checked by
// `with_protocol_versions`.
fn provider_with_suites(suites: &[SupportedCipherSuite]) -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    if !suites.is_empty() {
        provider.cipher_suites = suites.to_vec();
    }
    provider
}

fn version_set(
    min: Option<ProtocolVersion>,
    max: Option<ProtocolVersion>,
) -> Vec<&'static rustls::SupportedProtocolVersion> {
    fn rank(version: ProtocolVersion) -> u16 {
        match version {
            ProtocolVersion::TLSv1_2 => 2,
            ProtocolVersion::TLSv1_3 => 3,
            _ => 0,
        }
    }

    let lo = rank(min.unwrap_or(ProtocolVersion::TLSv1_2));
    let hi = rank(max.unwrap_or(ProtocolVersion::TLSv1_3));

    let mut versions = Vec::new();
    if lo <= 2 && hi >= 2 {
        versions.push(&rustls::version::TLS12);
    }
    if lo <= 3 && hi >= 3 {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

/// Certificate verifier that accepts any peer.
///
/// Installed when the verify mode is [`VerifyMode::None`]; signature checks
/// are skipped entirely.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl NoVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Certificate;

    fn generated_identity() -> (CertificateChain, PrivateKey) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let chain = CertificateChain::from_pem(generated.cert.pem().as_bytes()).unwrap();
        let key = PrivateKey::from_pem(generated.key_pair.serialize_pem().as_bytes()).unwrap();
        (chain, key)
    }

    #[test]
    fn client_builder_defaults() {
        let builder = ClientConfigBuilder::new();
        assert!(builder.root_certs.is_empty());
        assert!(builder.alpn_protocols.is_empty());
        assert!(builder.enable_sni);
        assert_eq!(builder.verify_mode, VerifyMode::Peer);
    }

    #[test]
    fn client_config_builds_without_roots() {
        let config = TlsConfig::client().build().unwrap();
        assert_eq!(config.role(), Role::Client);
        assert!(!config.alpn_required());
    }

    #[test]
    fn client_config_with_disabled_verification() {
        let config = TlsConfig::client()
            .verify_mode(VerifyMode::None)
            .build()
            .unwrap();
        assert_eq!(config.role(), Role::Client);
    }

    #[test]
    fn alpn_protocols_are_recorded() {
        let config = TlsConfig::client()
            .alpn_protocols(vec![b"h2".to_vec(), b"http/1.1".to_vec()])
            .require_alpn()
            .build()
            .unwrap();
        assert_eq!(config.alpn_protocols().len(), 2);
        assert!(config.alpn_required());
    }

    #[test]
    fn server_config_builds_from_generated_identity() {
        let (chain, key) = generated_identity();
        let config = TlsConfig::server(chain, key).build().unwrap();
        assert_eq!(config.role(), Role::Server);
    }

    #[test]
    fn server_config_without_sessions() {
        let (chain, key) = generated_identity();
        let config = TlsConfig::server(chain, key)
            .session_cache(SessionCacheMode::Disabled)
            .build()
            .unwrap();
        assert_eq!(config.role(), Role::Server);
    }

    #[test]
    fn restricted_cipher_suites_build() {
        let config = TlsConfig::client()
            .cipher_suites(vec![
                rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ])
            .build()
            .unwrap();
        assert_eq!(config.role(), Role::Client);
    }

    #[test]
    fn server_accepts_restricted_cipher_suites() {
        let (chain, key) = generated_identity();
        let config = TlsConfig::server(chain, key)
            .cipher_suites(vec![
                rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ])
            .build()
            .unwrap();
        assert_eq!(config.role(), Role::Server);
    }

    #[test]
    fn cipher_suites_contradicting_version_clamp_are_rejected() {
        // A TLS 1.3-only suite cannot satisfy a TLS 1.2-only configuration.
        let result = TlsConfig::client()
            .cipher_suites(vec![
                rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ])
            .max_version(ProtocolVersion::TLSv1_2)
            .build();
        assert!(matches!(result, Err(TlsError::ContextCreationFailed(_))));
    }

    #[test]
    fn version_clamp_rejects_empty_range() {
        let result = TlsConfig::client()
            .min_version(ProtocolVersion::TLSv1_3)
            .max_version(ProtocolVersion::TLSv1_2)
            .build();
        assert!(matches!(result, Err(TlsError::ContextCreationFailed(_))));
    }

    #[test]
    fn version_clamp_to_tls13_only() {
        let config = TlsConfig::client()
            .min_version(ProtocolVersion::TLSv1_3)
            .build()
            .unwrap();
        assert_eq!(config.role(), Role::Client);
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let (chain, _) = generated_identity();
        let (_, other_key) = generated_identity();
        let result = TlsConfig::server(chain, other_key).build();
        // The provider detects the mismatch at build time.
        assert!(result.is_err());
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        let chain = CertificateChain::from_cert(Certificate::from_der(vec![0xde, 0xad]));
        let (_, key) = generated_identity();
        let result = TlsConfig::server(chain, key).build();
        assert!(result.is_err());
    }
}
