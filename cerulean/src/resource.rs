//! Resource paths, OData query strings and connection-string parsing

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::TableError;

static VALID_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^#/\\?]{0,1024}$").unwrap());
static TABLE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z][A-Za-z0-9]{2,62}$").unwrap());

/// Validate a partition or row key against the service's character rule.
pub fn validate_key(key: &str) -> Result<(), TableError> {
    if VALID_KEY.is_match(key) {
        Ok(())
    } else {
        Err(TableError::InvalidKey)
    }
}

/// Validate a table name: a letter followed by 2-62 alphanumerics.
pub fn validate_table_name(table_name: &str) -> Result<(), TableError> {
    if TABLE_NAME.is_match(table_name) {
        Ok(())
    } else {
        Err(TableError::InvalidTableName(table_name.to_string()))
    }
}

/// Format the resource path for a table or a single entity.
///
/// With both keys this is the point-addressing form
/// `Table(PartitionKey='..',RowKey='..')` with percent-encoded key values;
/// otherwise just the table name.
pub fn format_resource(table_name: &str, partition_key: Option<&str>, row_key: Option<&str>) -> String {
    match (partition_key, row_key) {
        (Some(partition), Some(row)) => format!(
            "{}(PartitionKey='{}',RowKey='{}')",
            table_name,
            urlencoding::encode(partition),
            urlencoding::encode(row)
        ),
        _ => table_name.to_string(),
    }
}

/// Build the query string for an entity query, or `None` when no parameter
/// applies.
///
/// When exactly one of partition/row is given, the corresponding
/// `PartitionKey eq '..'`/`RowKey eq '..'` predicate is injected and ANDed
/// with any caller filter. Continuation tokens are passed back as
/// `NextPartitionKey`/`NextRowKey`.
pub fn format_query(
    partition: Option<&str>,
    row: Option<&str>,
    filter: Option<&str>,
    top: Option<u32>,
    fields: &[String],
    next_partition: Option<&str>,
    next_row: Option<&str>,
) -> Option<String> {
    let filter = match (partition, row) {
        (Some(partition), None) => Some(combine_filter(&format!("PartitionKey eq '{partition}'"), filter)),
        (None, Some(row)) => Some(combine_filter(&format!("RowKey eq '{row}'"), filter)),
        _ => filter.map(|f| f.to_string()),
    };

    let top = top.filter(|t| *t > 0).map(|t| t.to_string());
    let select = if fields.is_empty() {
        None
    } else {
        Some(fields.join(","))
    };

    let parameters = [
        ("$filter", filter.as_deref()),
        ("$top", top.as_deref()),
        ("$select", select.as_deref()),
        ("NextPartitionKey", next_partition),
        ("NextRowKey", next_row),
    ];

    let query = parameters
        .iter()
        .filter_map(|(name, value)| value.map(|v| format!("{}={}", name, urlencoding::encode(v))))
        .collect::<Vec<_>>()
        .join("&");

    if query.is_empty() { None } else { Some(query) }
}

fn combine_filter(indexer: &str, filter: Option<&str>) -> String {
    match filter {
        Some(filter) if !filter.is_empty() => format!("{indexer} and ({filter})"),
        _ => indexer.to_string(),
    }
}

/// Typed configuration parsed from a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfig {
    /// The local storage emulator with its well-known account.
    Development,
    /// A hosted storage account.
    Account {
        name: String,
        key: String,
        use_ssl: bool,
    },
}

/// Parse a semicolon-delimited `key=value` connection string.
///
/// Keys are matched case-insensitively. `UseDevelopmentStorage=true` selects
/// the emulator and conflicts with explicit account settings; the
/// `DevelopmentStorageProxyUri` and `TableEndpoint` options are not
/// implemented and fail rather than being silently ignored.
pub fn parse_connection_string(connection_string: &str) -> Result<ConnectionConfig, TableError> {
    let values = parse_key_values(connection_string)?;

    let development = values
        .get("usedevelopmentstorage")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    if development {
        if values.contains_key("developmentstorageproxyuri") {
            return Err(TableError::NotSupported(
                "development storage proxy".to_string(),
            ));
        }
        if values.contains_key("accountname") || values.contains_key("accountkey") {
            return Err(TableError::ConnectionString(
                "cannot specify an account name/key for development storage".to_string(),
            ));
        }

        return Ok(ConnectionConfig::Development);
    }

    let use_ssl = match values.get("defaultendpointsprotocol").map(|p| p.to_lowercase()) {
        None => false,
        Some(protocol) if protocol == "http" => false,
        Some(protocol) if protocol == "https" => true,
        Some(protocol) => {
            return Err(TableError::NotSupported(format!("protocol {protocol:?}")));
        }
    };

    let name = values
        .get("accountname")
        .ok_or_else(|| TableError::ConnectionString("no account name".to_string()))?
        .clone();
    let key = values
        .get("accountkey")
        .ok_or_else(|| TableError::ConnectionString("no account key".to_string()))?
        .clone();

    if values.contains_key("tableendpoint") {
        return Err(TableError::NotSupported("custom table endpoint".to_string()));
    }

    Ok(ConnectionConfig::Account { name, key, use_ssl })
}

fn parse_key_values(connection_string: &str) -> Result<HashMap<String, String>, TableError> {
    let mut values = HashMap::new();

    for element in connection_string.split(';').filter(|e| !e.is_empty()) {
        let (key, value) = element.split_once('=').ok_or_else(|| {
            TableError::ConnectionString(format!("expected key=value, found {element:?}"))
        })?;
        values.insert(key.to_lowercase(), value.to_string());
    }

    Ok(values)
}
