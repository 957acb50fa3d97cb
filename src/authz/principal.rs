use uuid::Uuid;

use super::patterns;

/// Principal represents the authenticated user with the permission snapshot
/// carried by their access token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Option<String>,
    pub factory_id: Option<Uuid>,
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: None,
            factory_id: None,
            permissions: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    pub fn with_factory(mut self, factory_id: Option<Uuid>) -> Self {
        self.factory_id = factory_id;
        self
    }

    pub fn with_permissions(mut self, perms: impl IntoIterator<Item = String>) -> Self {
        self.permissions = perms.into_iter().collect();
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        patterns::has_permission(&self.permissions, permission)
    }

    /// Holds the global wildcard, which also lifts factory boundaries.
    pub fn is_global(&self) -> bool {
        self.permissions.iter().any(|code| patterns::is_global_wildcard(code))
    }
}

/// Resource context for factory-scoped permission checks
#[derive(Debug, Clone, Default)]
pub struct ResourceContext {
    pub factory_id: Option<Uuid>,
    /// The action changes state rather than reading it.
    pub write: bool,
}

impl ResourceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(mut self, factory_id: Option<Uuid>) -> Self {
        self.factory_id = factory_id;
        self
    }

    pub fn for_write(mut self) -> Self {
        self.write = true;
        self
    }
}
