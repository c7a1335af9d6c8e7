use serde::{Deserialize, Serialize};

// ============================================================================
// Roles
// ============================================================================

/// Privilege tier granted by the allow-list.
///
/// Variants are declared in ascending privilege order so the derived `Ord`
/// gives `ReadOnly < User < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    ReadOnly,
    User,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::ReadOnly, Role::User, Role::Admin];

    pub fn as_str(&self) -> &str {
        match self {
            Role::ReadOnly => "ReadOnly",
            Role::User => "User",
            Role::Admin => "Admin",
        }
    }

    /// True when this role grants at least the privileges of `required`.
    pub fn has_role(&self, required: Role) -> bool {
        *self >= required
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a role string as stored in the allow-list. Case-insensitive.
impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" | "administrator" => Ok(Role::Admin),
            "user" | "editor" => Ok(Role::User),
            "readonly" | "read-only" | "read_only" | "read only" | "viewer" => Ok(Role::ReadOnly),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// A role string that names none of the known roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl std::fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown role: {}", self.0)
    }
}

impl std::error::Error for UnknownRole {}

// ============================================================================
// Capabilities
// ============================================================================

/// Boolean permission flags consumed by presentation components.
///
/// Derived from the session role on every change and never persisted.
/// Reading, searching and communication links are baseline access for any
/// authorized session and are therefore not represented here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub can_create: bool,
    pub can_edit: bool,
    pub can_delete: bool,
    pub can_bulk_select: bool,
    pub can_bulk_delete: bool,
    pub can_export: bool,
    pub is_read_only: bool,
    pub is_user: bool,
    pub is_admin: bool,
}

impl CapabilitySet {
    /// Resolve the capability flags for a role. `None` yields the all-false
    /// defaults used while a session is loading or unauthorized.
    pub fn for_role(role: Option<Role>) -> Self {
        let Some(role) = role else {
            return Self::default();
        };

        let can_write = role.has_role(Role::User);
        let can_destroy = role.has_role(Role::Admin);

        Self {
            can_create: can_write,
            can_edit: can_write,
            can_delete: can_destroy,
            can_bulk_select: can_write,
            can_bulk_delete: can_destroy,
            can_export: can_write,
            is_read_only: role == Role::ReadOnly,
            is_user: role == Role::User,
            is_admin: role == Role::Admin,
        }
    }

    /// Capability flags as (name, value) pairs in display order.
    pub fn flags(&self) -> [(&'static str, bool); 9] {
        [
            ("canCreate", self.can_create),
            ("canEdit", self.can_edit),
            ("canDelete", self.can_delete),
            ("canBulkSelect", self.can_bulk_select),
            ("canBulkDelete", self.can_bulk_delete),
            ("canExport", self.can_export),
            ("isReadOnly", self.is_read_only),
            ("isUser", self.is_user),
            ("isAdmin", self.is_admin),
        ]
    }
}

impl From<Option<Role>> for CapabilitySet {
    fn from(role: Option<Role>) -> Self {
        Self::for_role(role)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Read-only projection of the identity provider's signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub tenant_id: String,
    pub home_account_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[default]
    Loading,
    Authorized,
    Unauthorized,
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Loading => "loading",
            SessionStatus::Authorized => "authorized",
            SessionStatus::Unauthorized => "unauthorized",
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Warning,
    Info,
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::Success => "success",
            NotificationKind::Error => "error",
            NotificationKind::Warning => "warning",
            NotificationKind::Info => "info",
        }
    }
}

// ============================================================================
// Directory API types
// ============================================================================

/// Allow-list lookup result returned by the directory collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationResponse {
    pub is_authorized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl AuthorizationResponse {
    pub fn granted(role: impl Into<String>) -> Self {
        Self {
            is_authorized: true,
            role: Some(role.into()),
        }
    }

    pub fn denied() -> Self {
        Self {
            is_authorized: false,
            role: None,
        }
    }

    /// Role granted by this response. Authorized users whose role is missing
    /// or unrecognised fall back to `ReadOnly`.
    pub fn resolved_role(&self) -> Option<Role> {
        if !self.is_authorized {
            return None;
        }
        Some(
            self.role
                .as_deref()
                .and_then(|role| role.parse().ok())
                .unwrap_or(Role::ReadOnly),
        )
    }
}
