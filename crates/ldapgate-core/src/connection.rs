use std::sync::{Arc, Mutex};
use std::time::Duration;

use ldap3::{LdapConn, LdapConnSettings, Scope, SearchEntry};
use rustls::ClientConfig;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::tls::{build_client_config, CertificateInfo, PinnedCertificate, TlsPolicy};

/// TLS mode for LDAP connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    None,
    Ldaps,
    StartTls,
}

impl TlsMode {
    pub fn is_tls(&self) -> bool {
        !matches!(self, TlsMode::None)
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            TlsMode::Ldaps => "ldaps",
            TlsMode::StartTls | TlsMode::None => "ldap",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TlsMode::Ldaps => 636,
            TlsMode::StartTls | TlsMode::None => 389,
        }
    }
}

/// The directory servers an instance talks to. Hosts are tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    hosts: Vec<String>,
    port: u16,
}

impl ServerIdentity {
    pub fn new(hosts: Vec<String>, port: u16) -> Self {
        Self { hosts, port }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// LDAP URL for one host. IPv6 literals are bracketed.
    pub fn url_for(&self, host: &str, mode: TlsMode) -> String {
        if host.contains(':') && !host.starts_with('[') {
            format!("{}://[{}]:{}", mode.scheme(), host, self.port)
        } else {
            format!("{}://{}:{}", mode.scheme(), host, self.port)
        }
    }
}

/// Everything needed to open one session to one host.
#[derive(Debug, Clone)]
pub struct ConnectRequest<'a> {
    pub url: &'a str,
    pub timeout: Duration,
    pub starttls: bool,
    pub tls_config: Option<Arc<ClientConfig>>,
}

/// Outcome of a simple bind as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub rc: u32,
    pub text: String,
}

/// An open LDAP session.
pub trait Session {
    fn bind(&mut self, bind_dn: &str, password: &str) -> Result<BindResponse, CoreError>;

    /// Subtree search returning all attributes of every matching entry.
    fn search_subtree(&mut self, base_dn: &str, filter: &str)
        -> Result<Vec<SearchEntry>, CoreError>;

    fn unbind(&mut self) -> Result<(), CoreError>;
}

/// Opens sessions; the seam between `DirectoryClient` and the LDAP library.
pub trait Connector {
    type Session: Session;

    fn open(&self, request: &ConnectRequest<'_>) -> Result<Self::Session, CoreError>;
}

/// Blocking connector backed by `ldap3::LdapConn`. ldap3 always speaks LDAPv3.
#[derive(Debug, Clone, Copy, Default)]
pub struct LdapConnector;

impl Connector for LdapConnector {
    type Session = LdapConn;

    fn open(&self, request: &ConnectRequest<'_>) -> Result<LdapConn, CoreError> {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(request.timeout)
            .set_starttls(request.starttls);
        if let Some(config) = &request.tls_config {
            settings = settings.set_config(config.clone());
        }

        LdapConn::with_settings(settings, request.url)
            .map_err(|e| CoreError::ConnectionFailed(format!("{}: {e}", request.url)))
    }
}

impl Session for LdapConn {
    fn bind(&mut self, bind_dn: &str, password: &str) -> Result<BindResponse, CoreError> {
        let result = self.simple_bind(bind_dn, password)?;
        Ok(BindResponse {
            rc: result.rc,
            text: result.text,
        })
    }

    fn search_subtree(
        &mut self,
        base_dn: &str,
        filter: &str,
    ) -> Result<Vec<SearchEntry>, CoreError> {
        let (entries, _res) = self
            .search(base_dn, Scope::Subtree, filter, Vec::<&str>::new())?
            .success()
            .map_err(|e| CoreError::SearchFailed(format!("{}", e)))?;

        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    fn unbind(&mut self) -> Result<(), CoreError> {
        LdapConn::unbind(self).map_err(CoreError::Ldap)
    }
}

/// A directory client owning at most one connection at a time.
///
/// Construction stores configuration only. `connect` opens the connection,
/// `close` (or dropping the client) releases it. Bind and search calls
/// require an open connection and fail with [`CoreError::NotConnected`]
/// otherwise.
pub struct DirectoryClient<C: Connector = LdapConnector> {
    server: ServerIdentity,
    tls: TlsPolicy,
    connector: C,
    session: Option<C::Session>,
    captured: Arc<Mutex<Option<CertificateInfo>>>,
}

impl DirectoryClient {
    pub fn new(hosts: Vec<String>, port: u16, tls: TlsPolicy) -> Self {
        Self::with_connector(hosts, port, tls, LdapConnector)
    }

    /// Construct from the plugin's flat settings.
    pub fn from_flags(
        hosts: Vec<String>,
        port: u16,
        use_ssl: bool,
        verify_cert: bool,
        pinned: Option<PinnedCertificate>,
    ) -> Self {
        Self::new(hosts, port, TlsPolicy::from_flags(use_ssl, verify_cert, pinned))
    }
}

impl<C: Connector> DirectoryClient<C> {
    pub fn with_connector(hosts: Vec<String>, port: u16, tls: TlsPolicy, connector: C) -> Self {
        Self {
            server: ServerIdentity::new(hosts, port),
            tls,
            connector,
            session: None,
            captured: Arc::new(Mutex::new(None)),
        }
    }

    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    pub fn tls_policy(&self) -> &TlsPolicy {
        &self.tls
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Close any open connection, then connect to the first reachable host.
    ///
    /// When every host fails, the error from the last host is returned. A
    /// certificate refused by the TLS hook is reported as
    /// [`CoreError::CertificateRejected`].
    pub fn connect(&mut self, timeout: Duration) -> Result<(), CoreError> {
        self.close();

        let mut last_err = None;
        for host in self.server.hosts() {
            let url = self.server.url_for(host, self.tls.mode);
            let tls_config = if self.tls.mode.is_tls() {
                Some(build_client_config(
                    &self.tls,
                    self.captured.clone(),
                    host,
                    self.server.port(),
                )?)
            } else {
                None
            };
            self.take_captured();

            let request = ConnectRequest {
                url: &url,
                timeout,
                starttls: self.tls.mode == TlsMode::StartTls,
                tls_config,
            };

            debug!("Connecting to {}", url);
            match self.connector.open(&request) {
                Ok(session) => {
                    info!("Connected to {}", url);
                    self.session = Some(session);
                    return Ok(());
                }
                Err(err) => {
                    let err = match self.take_captured() {
                        Some(cert) => CoreError::CertificateRejected(Box::new(cert)),
                        None => err,
                    };
                    warn!("Connection to {} failed: {}", url, err);
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| CoreError::ConnectionFailed("no hosts configured".to_string())))
    }

    /// Unbind and drop the active connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.unbind() {
                Ok(()) => debug!("Connection closed"),
                Err(e) => warn!("Unbind failed while closing connection: {}", e),
            }
        }
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut C::Session, CoreError> {
        self.session.as_mut().ok_or(CoreError::NotConnected)
    }

    fn take_captured(&self) -> Option<CertificateInfo> {
        self.captured.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl<C: Connector> Drop for DirectoryClient<C> {
    fn drop(&mut self) {
        self.close();
    }
}
