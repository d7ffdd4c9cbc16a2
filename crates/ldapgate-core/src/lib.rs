pub mod auth;
pub mod authenticator;
pub mod config;
pub mod connection;
pub mod error;
pub mod search;
pub mod tls;

pub use authenticator::{AuthOutcome, Authenticator, ServiceBind, UserLookup};
pub use config::DirectoryConfig;
pub use connection::{DirectoryClient, TlsMode};
pub use error::CoreError;
pub use tls::{PinnedCertificate, TlsPolicy, TrustRoots};
