//! Caller capability lookup.
use std::collections::HashMap;

use crate::audit::ActorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

impl Role {
    pub fn can_verify(&self) -> bool {
        matches!(self, Role::Staff | Role::Admin)
    }
    pub fn can_administer(&self) -> bool {
        matches!(self, Role::Admin)
    }
    pub fn actor_type(&self) -> ActorType {
        match self {
            Role::Customer => ActorType::Customer,
            Role::Staff | Role::Admin => ActorType::Staff,
        }
    }
}

/// Resolves who a caller is. Implemented by the surrounding identity service.
pub trait AuthorityResolver: Send + Sync {
    fn role_of(&self, actor_id: &str) -> Option<Role>;
}

/// Fixed role table, for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthority {
    roles: HashMap<String, Role>,
}

impl StaticAuthority {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn grant(mut self, actor_id: &str, role: Role) -> Self {
        self.roles.insert(actor_id.to_string(), role);
        self
    }
}

impl AuthorityResolver for StaticAuthority {
    fn role_of(&self, actor_id: &str) -> Option<Role> {
        self.roles.get(actor_id).copied()
    }
}

/// Audit actor type for a caller whose role may be unknown.
pub(crate) fn actor_type_of(role: Option<Role>) -> ActorType {
    role.map(|r| r.actor_type()).unwrap_or(ActorType::Customer)
}
