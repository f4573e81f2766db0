//! Error types for unit-of-work operations.

use std::fmt;

/// The primary error type for all sessionkit operations.
#[derive(Debug)]
pub enum Error {
    /// A delete-orphan governed entity reached flush with no owning parent
    Orphan(OrphanError),
    /// Ordering or constraint failure detected by the flush coordinator
    Flush(FlushError),
    /// Integrity violation reported by the backend, passed through verbatim
    Integrity(QueryError),
    /// Any other backend failure
    Query(QueryError),
    /// API misuse
    InvalidRequest(InvalidRequestError),
    /// Attribute access on an instance whose row no longer exists
    StaleReference(StaleReferenceError),
    /// Invalid mapping metadata, raised while building a registry
    Mapping(MappingError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct OrphanError {
    /// Mapper name of the orphaned instance.
    pub mapper: String,
    /// Process-unique instance id.
    pub instance: u64,
    /// The delete-orphan relationships that would have to own it, as `Mapper.relationship`.
    pub relationships: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FlushError {
    pub kind: FlushErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushErrorKind {
    /// Dependency cycle with no edge that can be deferred to a post-update
    CircularDependency,
    /// UPDATE matched a row count other than one
    StaleData,
    /// A foreign key that is also part of the primary key would be set to NULL
    PrimaryKeyBlankout,
    /// An instance has no usable primary key after its INSERT
    MissingPrimaryKey,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement or transaction-control primitive the backend does not offer
    Unsupported,
    /// Other database error
    Database,
}

#[derive(Debug, Clone)]
pub struct InvalidRequestError {
    pub kind: InvalidRequestKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRequestKind {
    /// Operation needs a tracked instance
    Detached,
    /// The instance is owned by a different session
    AlreadyTrackedElsewhere,
    /// Another instance is already tracked under the same identity key
    IdentityConflict,
    /// A previous flush failed; only rollback is allowed
    Faulted,
    /// Commit or rollback addressed a frame that is not on top of the stack
    NotTopFrame,
    /// No transaction is active and autobegin is disabled
    NoTransaction,
    /// The frame was marked rollback-only by an inner rollback
    InactiveTransaction,
    /// Expire or refresh of an instance that has no database row
    NotPersistent,
    /// Capability not offered by the backend
    Unsupported,
    /// Attribute or relationship name not present on the mapper
    UnknownAttribute,
    /// Scalar operation on a collection or the other way round
    WrongRelationshipKind,
    /// The root transaction has been prepared; only commit or rollback is allowed
    Prepared,
}

#[derive(Debug, Clone)]
pub struct StaleReferenceError {
    pub mapper: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub mapper: Option<String>,
    pub message: String,
}

impl Error {
    /// Shorthand for an [`Error::InvalidRequest`].
    pub fn invalid(kind: InvalidRequestKind, message: impl Into<String>) -> Self {
        Error::InvalidRequest(InvalidRequestError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for an [`Error::Flush`].
    pub fn flush(kind: FlushErrorKind, message: impl Into<String>) -> Self {
        Error::Flush(FlushError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for an [`Error::Mapping`].
    pub fn mapping(mapper: Option<&str>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            mapper: mapper.map(str::to_string),
            message: message.into(),
        })
    }

    /// Is this a retryable error (deadlock, serialization failure)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            _ => false,
        }
    }

    /// Was this raised by the backend as a constraint violation?
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity(_))
    }

    /// Is this a synchronous usage error that left session state untouched?
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Error::InvalidRequest(_) | Error::Mapping(_))
    }

    /// The invalid-request kind, if this is one.
    pub fn invalid_request_kind(&self) -> Option<InvalidRequestKind> {
        match self {
            Error::InvalidRequest(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The flush failure kind, if this is one.
    pub fn flush_kind(&self) -> Option<FlushErrorKind> {
        match self {
            Error::Flush(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) | Error::Integrity(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Wrap into the matching [`Error`] family: constraint failures become
    /// [`Error::Integrity`], everything else [`Error::Query`].
    pub fn into_error(self) -> Error {
        if self.kind == QueryErrorKind::Constraint {
            Error::Integrity(self)
        } else {
            Error::Query(self)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Orphan(e) => write!(f, "Orphan error: {}", e),
            Error::Flush(e) => write!(f, "Flush error: {}", e),
            Error::Integrity(e) => write!(f, "Integrity error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::InvalidRequest(e) => write!(f, "Invalid request: {}", e),
            Error::StaleReference(e) => write!(f, "Stale reference: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) | Error::Integrity(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for OrphanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance {}#{} is not attached to any parent through {}",
            self.mapper,
            self.instance,
            self.relationships.join(", ")
        )
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} [{}]", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for InvalidRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StaleReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row for {} with key {} no longer exists",
            self.mapper, self.key
        )
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mapper {
            Some(mapper) => write!(f, "{}: {}", mapper, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<OrphanError> for Error {
    fn from(err: OrphanError) -> Self {
        Error::Orphan(err)
    }
}

impl From<FlushError> for Error {
    fn from(err: FlushError) -> Self {
        Error::Flush(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        err.into_error()
    }
}

impl From<InvalidRequestError> for Error {
    fn from(err: InvalidRequestError) -> Self {
        Error::InvalidRequest(err)
    }
}

impl From<StaleReferenceError> for Error {
    fn from(err: StaleReferenceError) -> Self {
        Error::StaleReference(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

/// Result type alias for sessionkit operations.
pub type Result<T> = std::result::Result<T, Error>;
