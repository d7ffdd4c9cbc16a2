use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{verify_server_cert_signed_by_trust_anchor, verify_server_name};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::connection::TlsMode;
use crate::error::CoreError;

/// How the TLS session of a directory connection is negotiated and trusted.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    pub mode: TlsMode,
    /// When false, any server certificate is accepted.
    pub verify_cert: bool,
    /// When set, the server certificate must carry exactly this thumbprint.
    pub pinned: Option<PinnedCertificate>,
    /// Roots used for chain validation when nothing is pinned.
    pub trust_roots: TrustRoots,
    /// Also require the chain-validated certificate to name the host it was
    /// reached on. Off by default, since hosts are often listed by IP address.
    pub verify_hostname: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            mode: TlsMode::None,
            verify_cert: true,
            pinned: None,
            trust_roots: TrustRoots::Native,
            verify_hostname: false,
        }
    }
}

impl TlsPolicy {
    /// Policy from the classic plugin flags: LDAPS on/off, verify on/off, optional pin.
    pub fn from_flags(use_ssl: bool, verify_cert: bool, pinned: Option<PinnedCertificate>) -> Self {
        Self {
            mode: if use_ssl { TlsMode::Ldaps } else { TlsMode::None },
            verify_cert,
            pinned,
            trust_roots: TrustRoots::Native,
            verify_hostname: false,
        }
    }
}

/// Source of trust anchors for certificate chain validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TrustRoots {
    /// The operating system certificate store.
    #[default]
    Native,
    /// A PEM bundle of CA certificates.
    CaFile(PathBuf),
}

impl TrustRoots {
    pub fn load(&self) -> Result<RootCertStore, CoreError> {
        match self {
            TrustRoots::Native => Ok(load_native_root_store()),
            TrustRoots::CaFile(path) => {
                let mut store = RootCertStore::empty();
                for cert in load_pem_certificates(path)? {
                    store.add(cert).map_err(|e| {
                        CoreError::Tls(format!("bad CA certificate in {}: {e}", path.display()))
                    })?;
                }
                Ok(store)
            }
        }
    }
}

/// Load the system's native root certificate store.
fn load_native_root_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    let certs_result = rustls_native_certs::load_native_certs();
    for err in &certs_result.errors {
        warn!("Skipping part of the native certificate store: {}", err);
    }
    for cert in certs_result.certs {
        let _ = store.add(cert);
    }
    debug!("Loaded {} native trust anchors", store.len());
    store
}

/// Read every `CERTIFICATE` block from a PEM file.
fn load_pem_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, CoreError> {
    let data = fs::read(path)
        .map_err(|e| CoreError::Tls(format!("cannot read {}: {e}", path.display())))?;

    let mut certs = Vec::new();
    for pem in x509_parser::pem::Pem::iter_from_buffer(&data) {
        let pem =
            pem.map_err(|e| CoreError::Tls(format!("invalid PEM in {}: {e}", path.display())))?;
        if pem.label == "CERTIFICATE" {
            certs.push(CertificateDer::from(pem.contents));
        }
    }

    if certs.is_empty() {
        return Err(CoreError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// DER bytes of the certificate in a PEM or DER file. For PEM, the first
/// `CERTIFICATE` block is used.
pub fn load_certificate_der(path: &Path) -> Result<Vec<u8>, CoreError> {
    let data = fs::read(path)
        .map_err(|e| CoreError::Tls(format!("cannot read {}: {e}", path.display())))?;

    if data.starts_with(b"-----BEGIN") {
        let cert = load_pem_certificates(path)?.remove(0);
        Ok(cert.as_ref().to_vec())
    } else {
        Ok(data)
    }
}

fn hex_upper(bytes: &[u8], sep: &str) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(sep)
}

/// Certificate thumbprint: SHA-1 of the DER bytes as uppercase hex with no
/// separators, the form shown by the Windows certificate store.
pub fn thumbprint(der: &[u8]) -> String {
    hex_upper(&Sha1::digest(der), "")
}

/// Compute the SHA-256 fingerprint of DER-encoded certificate bytes.
/// Returns a colon-separated uppercase hex string (e.g. "AB:CD:EF:...").
pub fn sha256_fingerprint(der: &[u8]) -> String {
    hex_upper(&Sha256::digest(der), ":")
}

/// The certificate a server must present, identified by thumbprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedCertificate {
    thumbprint: String,
    subject: Option<String>,
}

impl PinnedCertificate {
    /// Pin a thumbprint string as given. No normalisation is applied, so it
    /// must be uppercase hex without separators to ever match.
    pub fn from_thumbprint(thumbprint: impl Into<String>) -> Self {
        Self {
            thumbprint: thumbprint.into(),
            subject: None,
        }
    }

    /// Pin the certificate whose DER encoding is `der`.
    pub fn from_der(der: &[u8]) -> Result<Self, CoreError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| CoreError::Tls(format!("invalid certificate: {e}")))?;
        Ok(Self {
            thumbprint: thumbprint(der),
            subject: Some(cert.subject().to_string()),
        })
    }

    /// Load a certificate from a PEM or DER file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        Self::from_der(&load_certificate_der(path)?)
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Exact, case-sensitive thumbprint comparison against a presented certificate.
    pub fn matches(&self, der: &[u8]) -> bool {
        thumbprint(der) == self.thumbprint
    }
}

/// Details of a server certificate, kept when the handshake rejects it.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub host: String,
    pub port: u16,
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
    pub thumbprint: String,
    pub fingerprint_sha256: String,
}

impl fmt::Display for CertificateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} subject={} issuer={} thumbprint={}",
            self.host, self.port, self.subject, self.issuer, self.thumbprint
        )
    }
}

/// Parse certificate info from DER bytes.
pub fn parse_cert_info(der: &[u8], host: &str, port: u16) -> CertificateInfo {
    let (subject, issuer, not_before, not_after) = match x509_parser::parse_x509_certificate(der)
    {
        Ok((_, cert)) => {
            let validity = cert.validity();
            (
                cert.subject().to_string(),
                cert.issuer().to_string(),
                validity
                    .not_before
                    .to_rfc2822()
                    .unwrap_or_else(|_| validity.not_before.to_string()),
                validity
                    .not_after
                    .to_rfc2822()
                    .unwrap_or_else(|_| validity.not_after.to_string()),
            )
        }
        Err(_) => (
            "Unknown".to_string(),
            "Unknown".to_string(),
            "Unknown".to_string(),
            "Unknown".to_string(),
        ),
    };

    CertificateInfo {
        host: host.to_string(),
        port,
        subject,
        issuer,
        not_before,
        not_after,
        thumbprint: thumbprint(der),
        fingerprint_sha256: sha256_fingerprint(der),
    }
}

/// Server certificate check installed into the TLS handshake.
///
/// With verification disabled every certificate passes. With a pinned
/// certificate only an exact thumbprint match passes. Otherwise the chain is
/// validated against the policy's trust roots; the server name is checked only
/// when the policy asks for it. A rejected certificate is
/// written to the shared `captured` slot so the caller can report it.
#[derive(Debug)]
pub struct CertificateHook {
    verify_cert: bool,
    pinned: Option<PinnedCertificate>,
    roots: Option<Arc<RootCertStore>>,
    verify_hostname: bool,
    provider: Arc<CryptoProvider>,
    captured: Arc<Mutex<Option<CertificateInfo>>>,
    host: String,
    port: u16,
}

impl CertificateHook {
    pub fn new(
        policy: &TlsPolicy,
        captured: Arc<Mutex<Option<CertificateInfo>>>,
        host: &str,
        port: u16,
    ) -> Result<Self, CoreError> {
        let provider = Arc::new(crypto::ring::default_provider());

        // Trust roots are only consulted when nothing is pinned.
        let roots = if policy.verify_cert && policy.pinned.is_none() {
            Some(Arc::new(policy.trust_roots.load()?))
        } else {
            None
        };

        Ok(Self {
            verify_cert: policy.verify_cert,
            pinned: policy.pinned.clone(),
            roots,
            verify_hostname: policy.verify_hostname,
            provider,
            captured,
            host: host.to_string(),
            port,
        })
    }

    /// Whether the presented certificate would be accepted.
    pub fn accepts(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        now: UnixTime,
    ) -> bool {
        self.check(end_entity, intermediates, server_name, now).is_ok()
    }

    fn check(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if !self.verify_cert {
            return Ok(ServerCertVerified::assertion());
        }

        if let Some(pinned) = &self.pinned {
            if pinned.matches(end_entity.as_ref()) {
                return Ok(ServerCertVerified::assertion());
            }
            debug!(
                "Thumbprint mismatch for {}: expected {}",
                self.host,
                pinned.thumbprint()
            );
            return Err(TlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }

        let roots = self
            .roots
            .as_ref()
            .ok_or_else(|| TlsError::General("no trust roots loaded".to_string()))?;
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        if self.verify_hostname {
            verify_server_name(&cert, server_name)?;
        }
        Ok(ServerCertVerified::assertion())
    }
}

impl ServerCertVerifier for CertificateHook {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.check(end_entity, intermediates, server_name, now)
            .inspect_err(|err| {
                let cert_info = parse_cert_info(end_entity.as_ref(), &self.host, self.port);
                warn!("Rejected certificate {}: {}", cert_info, err);
                if let Ok(mut slot) = self.captured.lock() {
                    *slot = Some(cert_info);
                }
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build a rustls `ClientConfig` whose only certificate check is a `CertificateHook`.
pub fn build_client_config(
    policy: &TlsPolicy,
    captured: Arc<Mutex<Option<CertificateInfo>>>,
    host: &str,
    port: u16,
) -> Result<Arc<ClientConfig>, CoreError> {
    let hook = CertificateHook::new(policy, captured, host, port)?;
    let config = ClientConfig::builder_with_provider(hook.provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| CoreError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(hook))
        .with_no_client_auth();
    Ok(Arc::new(config))
}
