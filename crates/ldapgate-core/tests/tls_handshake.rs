use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ldap3::SearchEntry;
use ldapgate_core::connection::{BindResponse, ConnectRequest, Connector, Session};
use ldapgate_core::{CoreError, DirectoryClient, PinnedCertificate, TlsPolicy, TrustRoots};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConnection, Connection, ServerConfig, ServerConnection};

// Issued by ca.pem for DNS:dc1.example.com.
const LEAF_DER: &[u8] = include_bytes!("fixtures/leaf.der");
const LEAF_KEY_DER: &[u8] = include_bytes!("fixtures/leaf.key.der");
const LEAF_THUMBPRINT: &str = "D7A247320BDCC4635E09B054817CE5F6557A057A";

/// Connector that runs the client's TLS handshake against an in-memory
/// rustls server presenting `leaf.der`.
struct HandshakeConnector {
    server_config: Arc<ServerConfig>,
}

impl HandshakeConnector {
    fn new() -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(LEAF_DER.to_vec())],
                PrivatePkcs8KeyDer::from(LEAF_KEY_DER.to_vec()).into(),
            )
            .unwrap();
        Self {
            server_config: Arc::new(server_config),
        }
    }
}

struct HandshakeSession;

impl Session for HandshakeSession {
    fn bind(&mut self, _bind_dn: &str, _password: &str) -> Result<BindResponse, CoreError> {
        Ok(BindResponse {
            rc: 0,
            text: String::new(),
        })
    }

    fn search_subtree(
        &mut self,
        _base_dn: &str,
        _filter: &str,
    ) -> Result<Vec<SearchEntry>, CoreError> {
        Ok(Vec::new())
    }

    fn unbind(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

impl Connector for HandshakeConnector {
    type Session = HandshakeSession;

    fn open(&self, request: &ConnectRequest<'_>) -> Result<HandshakeSession, CoreError> {
        let failed =
            |e: rustls::Error| CoreError::ConnectionFailed(format!("{}: {e}", request.url));

        let tls_config = request
            .tls_config
            .clone()
            .ok_or_else(|| CoreError::ConnectionFailed("no TLS config".to_string()))?;
        let server_name = ServerName::try_from(host_of(request.url).to_string())
            .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;

        let mut client =
            Connection::Client(ClientConnection::new(tls_config, server_name).map_err(failed)?);
        let mut server =
            Connection::Server(ServerConnection::new(self.server_config.clone()).map_err(failed)?);
        complete_handshake(&mut client, &mut server).map_err(failed)?;
        Ok(HandshakeSession)
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.rsplit_once(':').map_or(rest, |(host, _)| host)
}

/// Shuttle TLS records between both ends until neither is handshaking.
fn complete_handshake(
    client: &mut Connection,
    server: &mut Connection,
) -> Result<(), rustls::Error> {
    while client.is_handshaking() || server.is_handshaking() {
        let sent = transfer(client, server)?;
        let received = transfer(server, client)?;
        if sent + received == 0 {
            return Err(rustls::Error::General("handshake stalled".to_string()));
        }
    }
    Ok(())
}

fn transfer(from: &mut Connection, to: &mut Connection) -> Result<usize, rustls::Error> {
    let io_err = |e: std::io::Error| rustls::Error::General(e.to_string());

    let mut records = Vec::new();
    while from.wants_write() {
        from.write_tls(&mut records).map_err(io_err)?;
    }
    let mut pending = &records[..];
    while !pending.is_empty() {
        to.read_tls(&mut pending).map_err(io_err)?;
        to.process_new_packets()?;
    }
    Ok(records.len())
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn ldaps_client(host: &str, policy: TlsPolicy) -> DirectoryClient<HandshakeConnector> {
    DirectoryClient::with_connector(
        vec![host.to_string()],
        636,
        policy,
        HandshakeConnector::new(),
    )
}

fn ca_policy(ca_file: &str) -> TlsPolicy {
    TlsPolicy {
        trust_roots: TrustRoots::CaFile(fixture(ca_file)),
        ..TlsPolicy::from_flags(true, true, None)
    }
}

#[test]
fn test_untrusted_certificate_rejected_during_connect() {
    let mut client = ldaps_client("10.0.0.5", ca_policy("other-ca.pem"));

    match client.connect(Duration::from_secs(5)) {
        Err(CoreError::CertificateRejected(info)) => {
            assert_eq!(info.host, "10.0.0.5");
            assert_eq!(info.port, 636);
            assert_eq!(info.thumbprint, LEAF_THUMBPRINT);
            assert!(info.subject.contains("dc1.example.com"));
        }
        other => panic!("expected a rejected certificate, got {other:?}"),
    }
    assert!(!client.is_connected());
}

#[test]
fn test_pin_mismatch_rejected_during_connect() {
    let policy = TlsPolicy::from_flags(
        true,
        true,
        Some(PinnedCertificate::from_thumbprint(
            "C60A848C6B209226BC72AFDA1C053490FE8A5EDE",
        )),
    );
    let mut client = ldaps_client("dc1.example.com", policy);

    let err = client.connect(Duration::from_secs(5)).unwrap_err();
    assert!(
        matches!(&err, CoreError::CertificateRejected(info) if info.thumbprint == LEAF_THUMBPRINT),
        "unexpected error {err:?}"
    );
}

#[test]
fn test_trusted_chain_connects_by_ip_address() {
    let mut client = ldaps_client("10.0.0.5", ca_policy("ca.pem"));
    client.connect(Duration::from_secs(5)).unwrap();
    assert!(client.is_connected());
    client.bind_anonymous().unwrap();
}

#[test]
fn test_matching_pin_connects() {
    let policy = TlsPolicy::from_flags(
        true,
        true,
        Some(PinnedCertificate::from_thumbprint(LEAF_THUMBPRINT)),
    );
    let mut client = ldaps_client("dc2.example.com", policy);
    client.connect(Duration::from_secs(5)).unwrap();
    assert!(client.is_connected());
}

#[test]
fn test_hostname_mismatch_rejected_when_requested() {
    let policy = TlsPolicy {
        verify_hostname: true,
        ..ca_policy("ca.pem")
    };
    let mut client = ldaps_client("10.0.0.5", policy);
    assert!(matches!(
        client.connect(Duration::from_secs(5)),
        Err(CoreError::CertificateRejected(_))
    ));
}
