//! Error types for the Concierge pipeline.

use thiserror::Error;

use crate::audit::DenialClass;

/// Why the Access Guard refused a request. Every variant maps to the same generic
/// caller-facing text; the variant itself only reaches logs and the audit log.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    #[error("identity is not registered")]
    Unauthorized,
    #[error("identity is locked out")]
    LockedOut,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("requested entities are outside the identity scope")]
    ScopeDenied,
    #[error("identity lacks the permission for this operation")]
    PermissionDenied,
}

impl AccessDenied {
    /// Audit class for this denial.
    pub fn class(&self) -> DenialClass {
        match self {
            AccessDenied::Unauthorized => DenialClass::Unauthorized,
            AccessDenied::LockedOut => DenialClass::LockedOut,
            AccessDenied::RateLimited => DenialClass::RateLimited,
            AccessDenied::ScopeDenied => DenialClass::ScopeDenied,
            AccessDenied::PermissionDenied => DenialClass::PermissionDenied,
        }
    }
}

/// Failure reported by a metrics data source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Worth retrying (timeouts, throttling, 5xx).
    #[error("transient fetch error: {0}")]
    Transient(String),
    /// Retrying cannot help (unknown entity, revoked token).
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

/// Failure reported by the NL-understanding oracle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle transient failure: {0}")]
    Transient(String),
    #[error("oracle failure: {0}")]
    Permanent(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The oracle produced no capability tag; the caller gets a clarifying question.
    #[error("intent could not be resolved")]
    IntentUnresolved,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrmError {
    #[error("CRM backend is not available")]
    Unavailable,
    #[error("CRM rejected the operation: {0}")]
    Rejected(String),
    #[error("CRM backend error: {0}")]
    Backend(String),
}

/// Errors while loading the identity registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry file: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry parse: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("identity with an empty key")]
    EmptyKey,
    #[error("identity {0} has an empty scope")]
    EmptyScope(String),
    #[error("identity {0} is registered twice")]
    Duplicate(String),
    #[error("identity {key} has unknown permission '{value}'")]
    InvalidPermission { key: String, value: String },
}

/// Errors while loading the entity catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog parse: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("entity {0} is declared twice")]
    Duplicate(String),
    #[error("top-level entity {0} cannot have a parent")]
    TopWithParent(String),
    #[error("entity {0} needs a parent")]
    MissingParent(String),
    #[error("entity {id} names unknown parent {parent}")]
    UnknownParent { id: String, parent: String },
    #[error("entity {id} has parent {parent} at the wrong level")]
    WrongParentLevel { id: String, parent: String },
}

/// Top-level error for assembling a Concierge instance.
#[derive(Error, Debug)]
pub enum ConciergeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),
    #[error("audit store: {0}")]
    Audit(#[from] sled::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot parse: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("no metrics source configured")]
    MissingSource,
}
