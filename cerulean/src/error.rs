//! Error types for table storage operations

use thiserror::Error;

/// HTTP status returned by the service for a failed precondition (stale ETag).
pub(crate) const STATUS_PRECONDITION_FAILED: u16 = 412;
/// HTTP status returned for a missing entity or table.
pub(crate) const STATUS_NOT_FOUND: u16 = 404;
/// HTTP status returned when an insert collides with an existing entity.
pub(crate) const STATUS_CONFLICT: u16 = 409;

/// Errors produced by the table storage client.
///
/// Validation and immutability errors are raised synchronously before any
/// network call and are never retried. `Protocol` carries the parsed service
/// error document; `Http` wraps transport-level failures, which the retry
/// policy treats as transient by default.
#[derive(Error, Debug)]
pub enum TableError {
    /// A partition or row key contains a forbidden character or is too long.
    #[error("invalid partition or row key: must not contain '#', '/', '\\' or '?' and be at most 1024 characters")]
    InvalidKey,

    /// A table name does not match the service's naming rule.
    #[error("invalid table name {0:?}: must start with a letter and be 3-63 alphanumeric characters")]
    InvalidTableName(String),

    /// An attempt to assign a reserved entity attribute after construction.
    #[error("reserved attribute {name:?} cannot be assigned directly")]
    ImmutableKey { name: String },

    /// A reserved attribute was constructed with a value of the wrong kind.
    #[error("type {kind:?} is not supported for {name:?}")]
    UnsupportedType { name: String, kind: &'static str },

    /// A conditional write was requested for an entity with no version token.
    #[error("the entity has no ETag; pass unconditional to overwrite blindly")]
    MissingEtag,

    /// The account secret is not valid base64.
    #[error("invalid account key: not valid base64")]
    InvalidAccountKey,

    /// A connection string is missing required keys or is otherwise malformed.
    #[error("malformed connection string: {0}")]
    ConnectionString(String),

    /// A connection-string option the client does not implement.
    #[error("{0} is not supported")]
    NotSupported(String),

    /// A non-success response from the service, with the parsed error document.
    #[error("table service error {status}: {code}: {message}")]
    Protocol {
        status: u16,
        code: String,
        message: String,
        body: String,
    },

    /// A transport-level failure before a response could be read.
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// A response document that could not be parsed.
    #[error("malformed response document: {0}")]
    Xml(String),

    /// A violation of batch constraints, or a malformed batch response.
    #[error("batch error: {0}")]
    Batch(String),
}

impl TableError {
    /// Parse a service error document into a `Protocol` error.
    ///
    /// The body is an XML document with `code` and `message` children; both
    /// default to empty when the body cannot be parsed (some failures carry
    /// no body at all).
    pub(crate) fn protocol(status: u16, body: &str) -> TableError {
        let mut code = String::new();
        let mut message = String::new();

        if let Ok(doc) = roxmltree::Document::parse(body) {
            for element in doc.root_element().children().filter(|n| n.is_element()) {
                match element.tag_name().name() {
                    "code" => code = element.text().unwrap_or_default().to_string(),
                    "message" => message = element.text().unwrap_or_default().to_string(),
                    _ => {}
                }
            }
        }

        TableError::Protocol {
            status,
            code,
            message,
            body: body.to_string(),
        }
    }

    /// The server-reported error code, when this is a protocol error.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            TableError::Protocol { code, .. } => Some(code),
            _ => None,
        }
    }

    /// The HTTP status, when this is a protocol error.
    pub fn status(&self) -> Option<u16> {
        match self {
            TableError::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for a write rejected because the supplied ETag no longer matches.
    pub fn is_precondition_failure(&self) -> bool {
        self.status() == Some(STATUS_PRECONDITION_FAILED)
    }

    /// True for a missing entity or table.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(STATUS_NOT_FOUND)
    }

    /// True for an insert that collided with an existing entity or table.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(STATUS_CONFLICT)
    }
}
