use std::time::Duration;

use ldap3::{dn_escape, ldap_escape};
use tracing::{info, warn};

use crate::config::DirectoryConfig;
use crate::connection::{Connector, DirectoryClient, LdapConnector};
use crate::error::CoreError;

/// Placeholder replaced by the (escaped) username in patterns and filters.
pub const USERNAME_PLACEHOLDER: &str = "%u";

/// Identity used for the lookup search before the user bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceBind {
    Anonymous,
    Credentials { bind_dn: String, password: String },
}

/// How a login name becomes a distinguished name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    /// Substitute the DN-escaped username into a DN template,
    /// e.g. `uid=%u,ou=people,dc=example,dc=com`.
    Pattern(String),
    /// Bind as `bind`, then take the first entry under `base` matching
    /// `filter` with the filter-escaped username substituted.
    Search {
        base: String,
        filter: String,
        bind: ServiceBind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated { dn: String },
    UserNotFound,
    InvalidCredentials,
}

/// Username/password verification against a directory.
///
/// Each call opens a fresh connection and closes it before returning.
pub struct Authenticator<C: Connector = LdapConnector> {
    client: DirectoryClient<C>,
    lookup: UserLookup,
    timeout: Duration,
}

impl Authenticator {
    pub fn from_config(config: &DirectoryConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let client = DirectoryClient::new(
            config.hosts.clone(),
            config.effective_port(),
            config.tls_policy()?,
        );
        Ok(Self::new(client, config.user_lookup()?, config.timeout()))
    }
}

impl<C: Connector> Authenticator<C> {
    pub fn new(client: DirectoryClient<C>, lookup: UserLookup, timeout: Duration) -> Self {
        Self {
            client,
            lookup,
            timeout,
        }
    }

    pub fn client(&self) -> &DirectoryClient<C> {
        &self.client
    }

    /// Verify `password` for `username`.
    ///
    /// Empty passwords are refused without contacting the server: most
    /// directories treat a simple bind with an empty password as an
    /// unauthenticated bind and report success.
    pub fn authenticate(&mut self, username: &str, password: &str) -> Result<AuthOutcome, CoreError> {
        if password.is_empty() {
            warn!("Refusing empty password for {}", username);
            return Ok(AuthOutcome::InvalidCredentials);
        }
        if username.is_empty() {
            return Ok(AuthOutcome::UserNotFound);
        }

        let result = self.connect_and_verify(username, password);
        self.client.close();

        if let Ok(outcome) = &result {
            info!("Authentication of {}: {:?}", username, outcome);
        }
        result
    }

    /// Resolve the DN for `username` without binding as the user.
    pub fn resolve_dn(&mut self, username: &str) -> Result<Option<String>, CoreError> {
        let result = self
            .client
            .connect(self.timeout)
            .and_then(|()| self.lookup_dn(username));
        self.client.close();
        result
    }

    fn connect_and_verify(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<AuthOutcome, CoreError> {
        self.client.connect(self.timeout)?;

        let Some(dn) = self.lookup_dn(username)? else {
            return Ok(AuthOutcome::UserNotFound);
        };

        match self.client.bind_with_credentials(&dn, password) {
            Ok(()) => Ok(AuthOutcome::Authenticated { dn }),
            Err(err) if err.is_invalid_credentials() => Ok(AuthOutcome::InvalidCredentials),
            Err(err) => Err(err),
        }
    }

    fn lookup_dn(&mut self, username: &str) -> Result<Option<String>, CoreError> {
        match &self.lookup {
            UserLookup::Pattern(pattern) => Ok(Some(
                pattern.replace(USERNAME_PLACEHOLDER, &dn_escape(username)),
            )),
            UserLookup::Search { base, filter, bind } => {
                match bind {
                    ServiceBind::Anonymous => self.client.bind_anonymous()?,
                    ServiceBind::Credentials { bind_dn, password } => {
                        self.client.bind_with_credentials(bind_dn, password)?
                    }
                }
                let filter = filter.replace(USERNAME_PLACEHOLDER, &ldap_escape(username));
                self.client.find_first_dn(base, &filter)
            }
        }
    }
}
