use tracing::debug;

use crate::connection::{Connector, DirectoryClient, Session};
use crate::error::CoreError;

impl<C: Connector> DirectoryClient<C> {
    /// Search the subtree under `search_base` and return the DN of the first
    /// matching entry, or `None` when nothing matches.
    pub fn find_first_dn(
        &mut self,
        search_base: &str,
        filter: &str,
    ) -> Result<Option<String>, CoreError> {
        let entries = self.session_mut()?.search_subtree(search_base, filter)?;

        debug!(
            "Subtree search under {} with {}: {} entries",
            search_base,
            filter,
            entries.len()
        );
        Ok(entries.into_iter().next().map(|entry| entry.dn))
    }
}
