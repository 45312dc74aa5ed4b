//! Role-based access control for table actions

use std::collections::HashMap;
use tracing::debug;

use tabula_common::config::RbacConfig;
use tabula_common::error::{Error, Result};
use tabula_common::types::Action;

/// Table key applying to every table a role has no explicit entry for
pub const WILDCARD: &str = "*";

/// Static role → table → actions permissions
#[derive(Debug, Clone, Default)]
pub struct RbacGuard {
    roles: HashMap<String, HashMap<String, Vec<Action>>>,
}

impl RbacGuard {
    #[must_use]
    pub fn new(config: &RbacConfig) -> Self {
        Self {
            roles: config.roles.clone(),
        }
    }

    /// Whether `role` may perform `action` on `table`
    ///
    /// An explicit entry for the table replaces the wildcard entry entirely,
    /// so an explicit empty list denies everything on that table.
    #[must_use]
    pub fn is_allowed(&self, role: &str, table: &str, action: Action) -> bool {
        let Some(permissions) = self.roles.get(role) else {
            return false;
        };
        permissions
            .get(table)
            .or_else(|| permissions.get(WILDCARD))
            .is_some_and(|actions| actions.contains(&action))
    }

    /// Enforce access when authentication is enabled
    ///
    /// # Errors
    /// Returns `Error::Forbidden` when the role is missing or not permitted.
    pub fn guard(&self, auth_enabled: bool, role: Option<&str>, table: &str, action: Action) -> Result<()> {
        if !auth_enabled {
            return Ok(());
        }
        let Some(role) = role else {
            return Err(Error::Forbidden("No role assigned".to_string()));
        };
        if self.is_allowed(role, table, action) {
            Ok(())
        } else {
            debug!(role, table, %action, "rbac denied");
            Err(Error::Forbidden(format!(
                "Role '{role}' may not {action} on '{table}'"
            )))
        }
    }
}
