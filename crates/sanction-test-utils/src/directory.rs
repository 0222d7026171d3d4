//! Role directory backed by a fixed table

use async_trait::async_trait;
use parking_lot::RwLock;
use sanction_core::{ApproverId, EngineError, RoleDirectory, RoleName};
use std::collections::{BTreeSet, HashMap};

/// Role directory answering from an in-memory table; unknown roles have no members
#[derive(Debug, Default)]
pub struct StaticRoleDirectory {
    roles: RwLock<HashMap<RoleName, BTreeSet<ApproverId>>>,
}

impl StaticRoleDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role with its members
    pub fn with_role(self, role: &str, members: &[&str]) -> Self {
        self.set_members(role, members);
        self
    }

    /// Replace the members of a role
    pub fn set_members(&self, role: &str, members: &[&str]) {
        self.roles.write().insert(
            RoleName::from(role),
            members.iter().map(|m| ApproverId::from(*m)).collect(),
        );
    }
}

#[async_trait]
impl RoleDirectory for StaticRoleDirectory {
    async fn members_of(&self, role: &RoleName) -> Result<BTreeSet<ApproverId>, EngineError> {
        Ok(self.roles.read().get(role).cloned().unwrap_or_default())
    }
}
