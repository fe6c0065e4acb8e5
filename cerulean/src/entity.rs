//! Schemaless table entity and typed field values

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TableError;
use crate::resource::validate_key;

/// A value stored in an entity field.
///
/// The service supports a fixed set of primitive kinds; anything else is
/// rejected at construction time. `Null` is never stored: assigning it to a
/// field removes the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    /// Null/absent value
    Null,
    /// Binary blob
    Binary(Vec<u8>),
    /// Boolean
    Bool(bool),
    /// UTC date and time
    DateTime(DateTime<Utc>),
    /// 64-bit float
    Double(f64),
    /// Unique identifier
    Guid(Uuid),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// String value
    String(String),
}

impl FieldValue {
    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// The name of this value's kind, as used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "Null",
            FieldValue::Binary(_) => "Binary",
            FieldValue::Bool(_) => "Boolean",
            FieldValue::DateTime(_) => "DateTime",
            FieldValue::Double(_) => "Double",
            FieldValue::Guid(_) => "Guid",
            FieldValue::Int32(_) => "Int32",
            FieldValue::Int64(_) => "Int64",
            FieldValue::String(_) => "String",
        }
    }

    /// The EDM type tag written to the wire, or `None` for strings (the
    /// implicit default) and nulls.
    pub fn edm_type(&self) -> Option<&'static str> {
        match self {
            FieldValue::Null | FieldValue::String(_) => None,
            FieldValue::Binary(_) => Some("Edm.Binary"),
            FieldValue::Bool(_) => Some("Edm.Boolean"),
            FieldValue::DateTime(_) => Some("Edm.DateTime"),
            FieldValue::Double(_) => Some("Edm.Double"),
            FieldValue::Guid(_) => Some("Edm.Guid"),
            FieldValue::Int32(_) => Some("Edm.Int32"),
            FieldValue::Int64(_) => Some("Edm.Int64"),
        }
    }

    /// Try to get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as 32-bit integer
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            FieldValue::Int32(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as 64-bit integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int64(i) => Some(*i),
            FieldValue::Int32(i) => Some(*i as i64),
            _ => None,
        }
    }

    /// Try to get as float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Double(f) => Some(*f),
            _ => None,
        }
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as GUID
    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            FieldValue::Guid(g) => Some(*g),
            _ => None,
        }
    }

    /// Try to get as UTC datetime
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Try to get as binary blob
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int32(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int64(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Binary(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        FieldValue::Guid(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::DateTime(value)
    }
}

/// A schemaless entity addressed by partition key and row key.
///
/// The keys are validated and fixed at construction; `etag` and `timestamp`
/// are assigned by the server and only updated internally from responses.
/// Everything else lives in an ordered field map, mutable through
/// [`TableEntity::set`] and [`TableEntity::remove`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntity {
    partition_key: String,
    row_key: String,
    etag: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    fields: BTreeMap<String, FieldValue>,
}

impl TableEntity {
    /// Create an empty entity with validated keys.
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Result<Self, TableError> {
        let partition_key = partition_key.into();
        let row_key = row_key.into();
        validate_key(&partition_key)?;
        validate_key(&row_key)?;

        Ok(Self {
            partition_key,
            row_key,
            etag: None,
            timestamp: None,
            fields: BTreeMap::new(),
        })
    }

    /// Build an entity from name/value pairs, extracting the reserved
    /// attributes by their exact, case-sensitive names.
    ///
    /// `PartitionKey`, `RowKey` and `ETag` must be string-valued; `Timestamp`
    /// must be a datetime. Any other name becomes a field. Reserved
    /// attributes of the wrong kind fail with a type error and the entity is
    /// not constructed.
    pub fn from_fields<K, I>(pairs: I) -> Result<Self, TableError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, FieldValue)>,
    {
        let mut partition_key = None;
        let mut row_key = None;
        let mut etag = None;
        let mut timestamp = None;
        let mut fields = BTreeMap::new();

        for (name, value) in pairs {
            let name = name.into();
            match name.as_str() {
                "PartitionKey" => partition_key = Some(require_string(&name, value)?),
                "RowKey" => row_key = Some(require_string(&name, value)?),
                "ETag" => etag = Some(require_string(&name, value)?),
                "Timestamp" => timestamp = Some(require_datetime(&name, value)?),
                _ => {
                    if !value.is_null() {
                        fields.insert(name, value);
                    }
                }
            }
        }

        let partition_key = partition_key.unwrap_or_default();
        let row_key = row_key.unwrap_or_default();
        validate_key(&partition_key)?;
        validate_key(&row_key)?;

        Ok(Self {
            partition_key,
            row_key,
            etag,
            timestamp,
            fields,
        })
    }

    /// Build an entity from name/value pairs, folding every name to
    /// lowercase before insertion.
    ///
    /// Reserved attributes are recognized in their folded forms
    /// (`partitionkey`, `rowkey`, `etag`, `timestamp`). Note the asymmetry
    /// with [`TableEntity::from_fields`], which preserves field-name case.
    pub fn from_pairs<K, I>(pairs: I) -> Result<Self, TableError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, FieldValue)>,
    {
        Self::from_fields(pairs.into_iter().map(|(name, value)| {
            let name: String = name.into();
            let folded = name.to_lowercase();
            let name = match folded.as_str() {
                "partitionkey" => "PartitionKey".to_string(),
                "rowkey" => "RowKey".to_string(),
                "etag" => "ETag".to_string(),
                "timestamp" => "Timestamp".to_string(),
                _ => folded,
            };
            (name, value)
        }))
    }

    /// The entity's partition key. Immutable after construction.
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// The entity's row key. Immutable after construction.
    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    /// The opaque version token assigned by the server, if any.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// The server-assigned last-modified instant, if any.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// The underlying field mapping.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Read a field. Absent fields yield `None`.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Write a field. Assigning [`FieldValue::Null`] removes the field.
    ///
    /// The reserved attributes cannot be assigned through this surface:
    /// the keys are immutable and `ETag`/`Timestamp` are server-authoritative.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Result<(), TableError> {
        let name = name.into();
        if matches!(name.as_str(), "PartitionKey" | "RowKey" | "ETag" | "Timestamp") {
            return Err(TableError::ImmutableKey { name });
        }

        let value = value.into();
        if value.is_null() {
            self.fields.remove(&name);
        } else {
            self.fields.insert(name, value);
        }

        Ok(())
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Assemble an entity from server-provided parts, skipping key
    /// validation (the service is authoritative for its own data).
    pub(crate) fn from_parts(
        partition_key: String,
        row_key: String,
        etag: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Self {
        Self {
            partition_key,
            row_key,
            etag,
            timestamp,
            fields,
        }
    }

    pub(crate) fn set_etag(&mut self, etag: Option<String>) {
        self.etag = etag;
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: Option<DateTime<Utc>>) {
        self.timestamp = timestamp;
    }

    /// Equality on keys and fields only, ignoring the server-assigned
    /// `etag` and `timestamp`.
    pub fn same_content(&self, other: &TableEntity) -> bool {
        self.partition_key == other.partition_key
            && self.row_key == other.row_key
            && self.fields == other.fields
    }
}

fn require_string(name: &str, value: FieldValue) -> Result<String, TableError> {
    match value {
        FieldValue::String(s) => Ok(s),
        other => Err(TableError::UnsupportedType {
            name: name.to_string(),
            kind: other.kind(),
        }),
    }
}

fn require_datetime(name: &str, value: FieldValue) -> Result<DateTime<Utc>, TableError> {
    match value {
        FieldValue::DateTime(dt) => Ok(dt),
        other => Err(TableError::UnsupportedType {
            name: name.to_string(),
            kind: other.kind(),
        }),
    }
}
