use thiserror::Error;

use crate::tls::CertificateInfo;

/// LDAP result code for a rejected bind (RFC 4511 `invalidCredentials`).
pub const RC_INVALID_CREDENTIALS: u32 = 49;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not connected to a directory server")]
    NotConnected,

    /// No host could be reached, or the connect timed out. This belongs with
    /// the bind and protocol failures; timeouts have no variant of their own.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("certificate rejected for {}:{} (thumbprint {})", .0.host, .0.port, .0.thumbprint)]
    CertificateRejected(Box<CertificateInfo>),

    #[error("bind failed (rc={rc}): {text}")]
    BindFailed { rc: u32, text: String },

    #[error("search failed: {0}")]
    SearchFailed(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ldap error: {0}")]
    Ldap(#[from] ldap3::LdapError),
}

impl CoreError {
    /// True when the server refused the supplied password or DN.
    pub fn is_invalid_credentials(&self) -> bool {
        matches!(self, CoreError::BindFailed { rc, .. } if *rc == RC_INVALID_CREDENTIALS)
    }
}
