use tracing::info;

use crate::connection::{Connector, DirectoryClient, Session};
use crate::error::CoreError;

impl<C: Connector> DirectoryClient<C> {
    /// Perform an anonymous bind on the open connection.
    pub fn bind_anonymous(&mut self) -> Result<(), CoreError> {
        let response = self.session_mut()?.bind("", "")?;

        if response.rc != 0 {
            return Err(CoreError::BindFailed {
                rc: response.rc,
                text: response.text,
            });
        }

        info!("Bound anonymously");
        Ok(())
    }

    /// Perform a simple bind with the given DN (or UPN) and password.
    /// The credentials are not kept after the call.
    pub fn bind_with_credentials(&mut self, username: &str, password: &str) -> Result<(), CoreError> {
        let response = self.session_mut()?.bind(username, password)?;

        if response.rc != 0 {
            return Err(CoreError::BindFailed {
                rc: response.rc,
                text: response.text,
            });
        }

        info!("Bound as {}", username);
        Ok(())
    }
}
