//! Error taxonomy shared by the registry, host, sessions, and apps.
use thiserror::Error;

use crate::{PlanetId, SchemaId};

/// Result alias for planet operations.
pub type PlanetResult<T> = Result<T, PlanetError>;

/// Error surface shared by the symbol table, registry, host, and sessions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanetError {
    /// An inherits-from chain loops back on itself.
    #[error("cyclic inheritance through {0}")]
    CyclicInheritance(String),
    /// An inherits-from reference names no known schema.
    #[error("{schema} inherits from unknown data model {ancestor}")]
    MissingAncestor {
        /// Data model URI of the inheriting schema.
        schema: String,
        /// The unresolved reference.
        ancestor: String,
    },
    /// A definition is malformed.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    /// No committed schema has this ID.
    #[error("schema {0} not found")]
    SchemaNotFound(SchemaId),
    /// The URI resolves to nothing.
    #[error("unknown uri {0}")]
    UnknownUri(String),
    /// No app is registered for a schema.
    #[error("no app registered for {0}")]
    AppNotFound(String),
    /// A URI is already claimed by another app.
    #[error("uri {0} is already claimed by another app")]
    AppConflict(String),
    /// An app declares no usable identity.
    #[error("invalid app: {0}")]
    InvalidApp(String),
    /// A request ID is already in use within the session.
    #[error("request {0} is already active")]
    DuplicateRequest(u64),
    /// No active request has this ID.
    #[error("request {0} not found")]
    RequestNotFound(u64),
    /// A cell request was resolved twice.
    #[error("request {0} is already resolved")]
    AlreadyResolved(u64),
    /// A pin was attempted before login.
    #[error("session is not logged in")]
    NotLoggedIn,
    /// No planet is mounted under this ID.
    #[error("planet {0} not found")]
    PlanetNotFound(PlanetId),
    /// The symbol ID space ran out.
    #[error("symbol id space exhausted")]
    SymbolSpaceExhausted,
    /// The schema ID space ran out.
    #[error("schema id space exhausted")]
    SchemaSpaceExhausted,
    /// The planet hit a fatal error and refuses registrations.
    #[error("planet {0} is faulted")]
    PlanetFaulted(PlanetId),
    /// The request was canceled before delivery.
    #[error("request canceled")]
    Canceled,
    /// The session's pipes are closed.
    #[error("session closed")]
    SessionClosed,
    /// The context is not running.
    #[error("{0} is not running")]
    NotRunning(String),
}

impl PlanetError {
    /// Fatal errors poison the owning planet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlanetError::SymbolSpaceExhausted | PlanetError::SchemaSpaceExhausted
        )
    }

    /// True for the cancellation family of errors.
    pub fn is_canceled(&self) -> bool {
        matches!(self, PlanetError::Canceled | PlanetError::SessionClosed)
    }
}
