use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::authenticator::{ServiceBind, UserLookup, USERNAME_PLACEHOLDER};
use crate::connection::TlsMode;
use crate::error::CoreError;
use crate::tls::{PinnedCertificate, TlsPolicy, TrustRoots};

/// Directory settings as stored in `config.toml`.
///
/// ```toml
/// hosts = ["dc1.example.com", "dc2.example.com"]
/// tls_mode = "ldaps"
/// pinned_thumbprint = "C60A848C6B209226BC72AFDA1C053490FE8A5EDE"
/// search_base = "dc=example,dc=com"
/// search_filter = "(sAMAccountName=%u)"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub hosts: Vec<String>,
    /// Defaults to 636 for LDAPS and 389 otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub tls_mode: TlsMode,
    #[serde(default = "default_true")]
    pub verify_cert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_cert_path: Option<PathBuf>,
    /// Compared verbatim against the server certificate's SHA-1 thumbprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_thumbprint: Option<String>,
    /// PEM bundle used instead of the OS certificate store for chain validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// Require the server certificate to name the host when validating its chain.
    #[serde(default)]
    pub verify_hostname: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dn_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_base: Option<String>,
    #[serde(default = "default_filter")]
    pub search_filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_bind_dn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_bind_password: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    10
}
fn default_filter() -> String {
    "(uid=%u)".to_string()
}

impl DirectoryConfig {
    /// `<config dir>/ldapgate/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ldapgate").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.tls_mode.default_port())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.hosts.is_empty() || self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(CoreError::Config(
                "at least one non-empty host is required".to_string(),
            ));
        }
        if self.pinned_cert_path.is_some() && self.pinned_thumbprint.is_some() {
            return Err(CoreError::Config(
                "pinned_cert_path and pinned_thumbprint are mutually exclusive".to_string(),
            ));
        }
        match (&self.dn_pattern, &self.search_base) {
            (Some(_), Some(_)) => {
                return Err(CoreError::Config(
                    "dn_pattern and search_base are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(CoreError::Config(
                    "either dn_pattern or search_base must be set".to_string(),
                ))
            }
            (Some(pattern), None) if !pattern.contains(USERNAME_PLACEHOLDER) => {
                return Err(CoreError::Config(format!(
                    "dn_pattern must contain {USERNAME_PLACEHOLDER}"
                )))
            }
            (None, Some(_)) if !self.search_filter.contains(USERNAME_PLACEHOLDER) => {
                return Err(CoreError::Config(format!(
                    "search_filter must contain {USERNAME_PLACEHOLDER}"
                )))
            }
            _ => {}
        }
        match (&self.search_bind_dn, &self.search_bind_password) {
            (None, Some(_)) => {
                return Err(CoreError::Config(
                    "search_bind_password given without search_bind_dn".to_string(),
                ))
            }
            (Some(_), None) => {
                return Err(CoreError::Config(
                    "search_bind_dn requires search_bind_password".to_string(),
                ))
            }
            (Some(_), Some(password)) if password.is_empty() => {
                return Err(CoreError::Config(
                    "search_bind_password must not be empty".to_string(),
                ))
            }
            _ => {}
        }
        Ok(())
    }

    /// Build the TLS policy, loading the pinned certificate file if one is set.
    pub fn tls_policy(&self) -> Result<TlsPolicy, CoreError> {
        let pinned = match (&self.pinned_cert_path, &self.pinned_thumbprint) {
            (Some(path), _) => Some(PinnedCertificate::load(path)?),
            (None, Some(thumbprint)) => Some(PinnedCertificate::from_thumbprint(thumbprint.clone())),
            (None, None) => None,
        };
        let trust_roots = match &self.ca_file {
            Some(path) => TrustRoots::CaFile(path.clone()),
            None => TrustRoots::Native,
        };

        Ok(TlsPolicy {
            mode: self.tls_mode,
            verify_cert: self.verify_cert,
            pinned,
            trust_roots,
            verify_hostname: self.verify_hostname,
        })
    }

    pub fn user_lookup(&self) -> Result<UserLookup, CoreError> {
        if let Some(pattern) = &self.dn_pattern {
            return Ok(UserLookup::Pattern(pattern.clone()));
        }
        let base = self
            .search_base
            .clone()
            .ok_or_else(|| CoreError::Config("search_base is not set".to_string()))?;
        let bind = match (&self.search_bind_dn, &self.search_bind_password) {
            (Some(bind_dn), Some(password)) => ServiceBind::Credentials {
                bind_dn: bind_dn.clone(),
                password: password.clone(),
            },
            (Some(_), None) => {
                return Err(CoreError::Config(
                    "search_bind_dn requires search_bind_password".to_string(),
                ))
            }
            (None, _) => ServiceBind::Anonymous,
        };

        Ok(UserLookup::Search {
            base,
            filter: self.search_filter.clone(),
            bind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = DirectoryConfig::from_toml(
            r#"
            hosts = ["ldap.example.com"]
            search_base = "dc=example,dc=com"
            "#,
        )
        .unwrap();

        assert_eq!(config.tls_mode, TlsMode::None);
        assert_eq!(config.effective_port(), 389);
        assert!(config.verify_cert);
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.search_filter, "(uid=%u)");
        config.validate().unwrap();

        match config.user_lookup().unwrap() {
            UserLookup::Search { base, bind, .. } => {
                assert_eq!(base, "dc=example,dc=com");
                assert_eq!(bind, ServiceBind::Anonymous);
            }
            other => panic!("unexpected lookup {other:?}"),
        }
    }

    #[test]
    fn test_ldaps_default_port() {
        let config = DirectoryConfig::from_toml(
            r#"
            hosts = ["dc1"]
            tls_mode = "ldaps"
            dn_pattern = "uid=%u,dc=example,dc=com"
            "#,
        )
        .unwrap();
        assert_eq!(config.effective_port(), 636);

        let config = DirectoryConfig {
            port: Some(3269),
            ..config
        };
        assert_eq!(config.effective_port(), 3269);
    }

    #[test]
    fn test_pinned_thumbprint_kept_verbatim() {
        let config = DirectoryConfig::from_toml(
            r#"
            hosts = ["dc1"]
            tls_mode = "ldaps"
            pinned_thumbprint = "c60a848c6b209226bc72afda1c053490fe8a5ede"
            dn_pattern = "uid=%u,dc=example,dc=com"
            "#,
        )
        .unwrap();
        let policy = config.tls_policy().unwrap();
        assert_eq!(
            policy.pinned.unwrap().thumbprint(),
            "c60a848c6b209226bc72afda1c053490fe8a5ede"
        );
        assert_eq!(policy.trust_roots, TrustRoots::Native);
        assert!(!policy.verify_hostname);
    }

    #[test]
    fn test_validation_errors() {
        let base = DirectoryConfig::from_toml(
            r#"
            hosts = ["dc1"]
            search_base = "dc=example,dc=com"
            "#,
        )
        .unwrap();

        let cases = [
            DirectoryConfig {
                hosts: vec![],
                ..base.clone()
            },
            DirectoryConfig {
                hosts: vec!["  ".to_string()],
                ..base.clone()
            },
            DirectoryConfig {
                dn_pattern: Some("uid=%u,dc=example,dc=com".to_string()),
                ..base.clone()
            },
            DirectoryConfig {
                search_base: None,
                ..base.clone()
            },
            DirectoryConfig {
                search_filter: "(uid=admin)".to_string(),
                ..base.clone()
            },
            DirectoryConfig {
                pinned_cert_path: Some(PathBuf::from("server.pem")),
                pinned_thumbprint: Some("AB".to_string()),
                ..base.clone()
            },
            DirectoryConfig {
                search_bind_password: Some("secret".to_string()),
                ..base.clone()
            },
            DirectoryConfig {
                search_bind_dn: Some("cn=svc,dc=example,dc=com".to_string()),
                ..base.clone()
            },
            DirectoryConfig {
                search_bind_dn: Some("cn=svc,dc=example,dc=com".to_string()),
                search_bind_password: Some(String::new()),
                ..base.clone()
            },
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(CoreError::Config(_))),
                "expected validation error for {config:?}"
            );
        }
    }

    #[test]
    fn test_service_bind_from_config() {
        let config = DirectoryConfig::from_toml(
            r#"
            hosts = ["dc1"]
            search_base = "dc=example,dc=com"
            search_filter = "(sAMAccountName=%u)"
            search_bind_dn = "cn=svc,dc=example,dc=com"
            search_bind_password = "hunter2"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(
            config.user_lookup().unwrap(),
            UserLookup::Search {
                base: "dc=example,dc=com".to_string(),
                filter: "(sAMAccountName=%u)".to_string(),
                bind: ServiceBind::Credentials {
                    bind_dn: "cn=svc,dc=example,dc=com".to_string(),
                    password: "hunter2".to_string(),
                },
            }
        );

        let without_password = DirectoryConfig {
            search_bind_password: None,
            ..config
        };
        assert!(matches!(
            without_password.user_lookup(),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            DirectoryConfig::from_toml("hosts = 5"),
            Err(CoreError::Config(_))
        ));
    }
}
