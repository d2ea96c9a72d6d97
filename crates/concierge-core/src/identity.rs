//! Identity Registry: phone-number keyed identities with a role, an entity scope and
//! a permission set. Loaded once at startup and read-only afterwards.
//!
//! File format (`identities.toml`):
//!
//! ```toml
//! [[identities]]
//! phone = "+1 (786) 555-0101"
//! name = "Tour Manager"
//! role = "client"
//! scope = ["120232002620350525"]
//! permissions = ["read"]
//!
//! [[identities]]
//! phone = "+17865550199"
//! role = "admin"
//! scope = ["*"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::hierarchy::EntityId;

/// Scope token meaning "every entity".
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Admin => "admin",
        }
    }
}

/// Operation permissions checked for CRM work; metrics queries only need `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Send,
    Update,
    Delete,
    Admin,
}

impl Permission {
    pub const ALL: [Permission; 6] = [
        Permission::Read,
        Permission::Write,
        Permission::Send,
        Permission::Update,
        Permission::Delete,
        Permission::Admin,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "send" => Some(Permission::Send),
            "update" => Some(Permission::Update),
            "delete" => Some(Permission::Delete),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Entities(BTreeSet<EntityId>),
}

impl Scope {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Scope::All)
    }

    pub fn contains(&self, entity: &EntityId) -> bool {
        match self {
            Scope::All => true,
            Scope::Entities(set) => set.contains(entity),
        }
    }

    /// True when every requested entity is inside this scope.
    pub fn covers(&self, requested: &BTreeSet<EntityId>) -> bool {
        match self {
            Scope::All => true,
            Scope::Entities(set) => requested.is_subset(set),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Normalized phone number.
    pub key: String,
    pub name: String,
    pub role: Role,
    pub scope: Scope,
    pub permissions: BTreeSet<Permission>,
}

impl Identity {
    /// Identity with the role's default permissions: admins get everything, clients read.
    pub fn new(key: &str, role: Role, scope: Scope) -> Self {
        let key = normalize_phone(key);
        let permissions = match role {
            Role::Admin => Permission::ALL.into_iter().collect(),
            Role::Client => BTreeSet::from([Permission::Read]),
        };
        Self {
            name: key.clone(),
            key,
            role,
            scope,
            permissions,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions = permissions.into_iter().collect();
        self
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission) || self.permissions.contains(&Permission::Admin)
    }
}

/// Canonical form of a phone number: separators removed, leading `+` guaranteed.
/// `"+1 (786) 555-0101"` and `"17865550101"` both become `"+17865550101"`.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '(' | ')' | '-' | '.' | '\t'))
        .collect();
    if digits.is_empty() || digits.starts_with('+') {
        digits
    } else {
        format!("+{digits}")
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    identities: Vec<IdentityEntry>,
}

#[derive(Debug, Deserialize)]
struct IdentityEntry {
    phone: String,
    #[serde(default)]
    name: Option<String>,
    role: Role,
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default)]
    permissions: Option<Vec<String>>,
}

impl IdentityEntry {
    fn into_identity(self) -> Result<Identity, RegistryError> {
        let key = normalize_phone(&self.phone);
        if key.is_empty() {
            return Err(RegistryError::EmptyKey);
        }
        if self.scope.is_empty() {
            return Err(RegistryError::EmptyScope(key));
        }
        let scope = if self.scope.iter().any(|s| s.trim() == WILDCARD) {
            Scope::All
        } else {
            Scope::Entities(self.scope.iter().map(|s| EntityId::new(s.trim())).collect())
        };

        let mut identity = Identity::new(&key, self.role, scope);
        if let Some(name) = self.name.filter(|n| !n.trim().is_empty()) {
            identity = identity.with_name(name);
        }
        if let Some(raw) = self.permissions {
            let mut permissions = BTreeSet::new();
            for value in raw {
                if value.trim() == WILDCARD {
                    permissions.extend(Permission::ALL);
                    continue;
                }
                match Permission::parse(&value) {
                    Some(p) => {
                        permissions.insert(p);
                    }
                    None => {
                        return Err(RegistryError::InvalidPermission { key, value });
                    }
                }
            }
            identity = identity.with_permissions(permissions);
        }
        Ok(identity)
    }
}

/// Read-only map from normalized phone number to identity.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    identities: HashMap<String, Arc<Identity>>,
}

impl IdentityRegistry {
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Result<Self, RegistryError> {
        let mut map = HashMap::new();
        for identity in identities {
            if identity.key.is_empty() {
                return Err(RegistryError::EmptyKey);
            }
            if let Scope::Entities(set) = &identity.scope {
                if set.is_empty() {
                    return Err(RegistryError::EmptyScope(identity.key));
                }
            }
            let key = identity.key.clone();
            if map.insert(key.clone(), Arc::new(identity)).is_some() {
                return Err(RegistryError::Duplicate(key));
            }
        }
        Ok(Self { identities: map })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(raw)?;
        let identities = file
            .identities
            .into_iter()
            .map(IdentityEntry::into_identity)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_identities(identities)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path)?;
        let registry = Self::from_toml_str(&raw)?;
        tracing::info!(
            target: "concierge::guard",
            path = %path.display(),
            identities = registry.len(),
            "Identity registry loaded"
        );
        Ok(registry)
    }

    /// Looks up an identity by any spelling of its phone number.
    pub fn lookup(&self, raw_key: &str) -> Option<Arc<Identity>> {
        self.identities.get(&normalize_phone(raw_key)).cloned()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Identities sorted by key, for operator listings.
    pub fn list(&self) -> Vec<Arc<Identity>> {
        let mut all: Vec<_> = self.identities.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[identities]]
phone = "+1 (786) 555-0101"
name = "Tour Manager"
role = "client"
scope = ["c1", "as2"]

[[identities]]
phone = "17865550199"
role = "admin"
scope = ["*"]

[[identities]]
phone = "+1 786.555.0102"
role = "client"
scope = ["c2"]
permissions = ["read", "send"]
"#;

    #[test]
    fn normalize_strips_separators_and_adds_plus() {
        assert_eq!(normalize_phone("+1 (786) 555-0101"), "+17865550101");
        assert_eq!(normalize_phone("1-786-555-0101"), "+17865550101");
        assert_eq!(normalize_phone(" +17865550101 "), "+17865550101");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn lookup_accepts_any_spelling() {
        let registry = IdentityRegistry::from_toml_str(SAMPLE).unwrap();
        assert_eq!(registry.len(), 3);
        let manager = registry.lookup("786 555 0101").map(|i| i.name.clone());
        // Without a country code the key differs, so no match.
        assert_eq!(manager, None);
        let manager = registry.lookup("1 (786) 555-0101").unwrap();
        assert_eq!(manager.name, "Tour Manager");
        assert_eq!(manager.role, Role::Client);
        assert!(manager.scope.contains(&EntityId::new("as2")));
        assert!(!manager.scope.contains(&EntityId::new("c2")));
    }

    #[test]
    fn role_defaults_and_explicit_permissions() {
        let registry = IdentityRegistry::from_toml_str(SAMPLE).unwrap();
        let admin = registry.lookup("+17865550199").unwrap();
        assert!(admin.scope.is_wildcard());
        assert!(admin.has_permission(Permission::Delete));

        let manager = registry.lookup("+17865550101").unwrap();
        assert!(manager.has_permission(Permission::Read));
        assert!(!manager.has_permission(Permission::Send));

        let sender = registry.lookup("+17865550102").unwrap();
        assert!(sender.has_permission(Permission::Send));
        assert!(!sender.has_permission(Permission::Write));
    }

    #[test]
    fn rejects_empty_scope_duplicates_and_bad_permissions() {
        let empty = "[[identities]]\nphone = \"+1555\"\nrole = \"client\"\nscope = []\n";
        assert!(matches!(
            IdentityRegistry::from_toml_str(empty),
            Err(RegistryError::EmptyScope(_))
        ));

        let dup = "[[identities]]\nphone = \"+1555\"\nrole = \"client\"\nscope = [\"a\"]\n\
                   [[identities]]\nphone = \"1 555\"\nrole = \"admin\"\nscope = [\"*\"]\n";
        assert!(matches!(
            IdentityRegistry::from_toml_str(dup),
            Err(RegistryError::Duplicate(_))
        ));

        let bad = "[[identities]]\nphone = \"+1555\"\nrole = \"client\"\nscope = [\"a\"]\npermissions = [\"fly\"]\n";
        assert!(matches!(
            IdentityRegistry::from_toml_str(bad),
            Err(RegistryError::InvalidPermission { .. })
        ));
    }

    #[test]
    fn wildcard_permission_grants_everything() {
        let raw = "[[identities]]\nphone = \"+1555\"\nrole = \"client\"\nscope = [\"a\"]\npermissions = [\"*\"]\n";
        let registry = IdentityRegistry::from_toml_str(raw).unwrap();
        let identity = registry.lookup("+1555").unwrap();
        assert_eq!(identity.permissions.len(), Permission::ALL.len());
    }
}
