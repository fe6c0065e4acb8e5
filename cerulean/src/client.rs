//! Client entry point: account configuration and table management

use std::sync::Arc;

use crate::auth::Account;
use crate::codec;
use crate::entity::{FieldValue, TableEntity};
use crate::error::TableError;
use crate::resource::{ConnectionConfig, parse_connection_string, validate_table_name};
use crate::retry::{NoRetries, RetryPolicy};
use crate::table::Table;
use crate::transport::{RestApi, RestClient};

const NEXT_TABLE_HEADER: &str = "x-ms-continuation-NextTableName";

/// A client for one storage account's table service.
///
/// Cheap to clone-by-reference through [`TableClient::table`]; holds no
/// per-request state beyond the signing credentials.
pub struct TableClient {
    rest: Arc<dyn RestApi>,
    use_ssl: bool,
}

impl TableClient {
    /// Create a client for a hosted storage account, with no retries.
    pub fn new(
        account_name: impl Into<String>,
        account_secret: &str,
        use_ssl: bool,
    ) -> Result<Self, TableError> {
        Self::with_retry_policy(account_name, account_secret, use_ssl, Arc::new(NoRetries))
    }

    /// Create a client with a retry policy applied to every request.
    pub fn with_retry_policy(
        account_name: impl Into<String>,
        account_secret: &str,
        use_ssl: bool,
        retry: Arc<dyn RetryPolicy>,
    ) -> Result<Self, TableError> {
        let account = Account::new(account_name, account_secret)?;
        Ok(Self {
            rest: Arc::new(RestClient::new(account, use_ssl, retry)),
            use_ssl,
        })
    }

    /// Create a client for the local storage emulator.
    pub fn development() -> Self {
        Self {
            rest: Arc::new(RestClient::new(
                Account::development(),
                false,
                Arc::new(NoRetries),
            )),
            use_ssl: false,
        }
    }

    /// Create a client from an Azure storage connection string.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, TableError> {
        match parse_connection_string(connection_string)? {
            ConnectionConfig::Development => Ok(Self::development()),
            ConnectionConfig::Account { name, key, use_ssl } => Self::new(name, &key, use_ssl),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_rest(rest: Arc<dyn RestApi>) -> Self {
        Self {
            rest,
            use_ssl: false,
        }
    }

    pub fn account_name(&self) -> &str {
        self.rest.account_name()
    }

    pub fn is_development_storage(&self) -> bool {
        self.rest.is_development_storage()
    }

    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    /// A handle for operations on the named table. Validates the name but
    /// performs no request.
    pub fn table(&self, table_name: &str) -> Result<Table, TableError> {
        validate_table_name(table_name)?;
        Ok(Table::new(table_name.to_string(), self.rest.clone()))
    }

    /// Create a new table, raising if it already exists.
    pub async fn create_table(&self, table_name: &str) -> Result<(), TableError> {
        self.create_table_impl(table_name, true).await.map(|_| ())
    }

    /// Create a new table, returning `false` if it already exists.
    pub async fn try_create_table(&self, table_name: &str) -> Result<bool, TableError> {
        self.create_table_impl(table_name, false).await
    }

    async fn create_table_impl(
        &self,
        table_name: &str,
        raise_on_conflict: bool,
    ) -> Result<bool, TableError> {
        validate_table_name(table_name)?;

        let entity = TableEntity::from_fields([("TableName", FieldValue::from(table_name))])?;
        let document = codec::serialize(&entity)?;
        let response = self.rest.post("Tables", &document).await?;

        if !response.succeeded() {
            let error = response.error();
            if !raise_on_conflict && error.is_conflict() {
                return Ok(false);
            }
            return Err(error);
        }

        Ok(true)
    }

    /// Delete an existing table.
    pub async fn delete_table(&self, table_name: &str) -> Result<(), TableError> {
        validate_table_name(table_name)?;

        let resource = format!("Tables('{table_name}')");
        let response = self.rest.delete(&resource, None).await?;
        response.ensure_succeeded()
    }

    /// Enumerate existing table names, following continuation unless
    /// disabled.
    pub async fn query_tables(&self, disable_continuation: bool) -> Result<Vec<String>, TableError> {
        let mut names = Vec::new();
        let mut next_table: Option<String> = None;

        loop {
            let query = next_table
                .as_deref()
                .map(|table| format!("NextTableName={}", urlencoding::encode(table)));

            let response = self.rest.get("Tables", query.as_deref()).await?;
            response.ensure_succeeded()?;

            next_table = response.header(NEXT_TABLE_HEADER).map(str::to_string);

            for entity in codec::deserialize_feed(&response.body)? {
                if let Some(name) = entity.get("TableName").and_then(FieldValue::as_str) {
                    names.push(name.to_string());
                }
            }

            if disable_continuation || next_table.is_none() {
                break;
            }
        }

        Ok(names)
    }
}

impl std::fmt::Debug for TableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableClient")
            .field("account", &self.rest.account_name())
            .field("use_ssl", &self.use_ssl)
            .finish()
    }
}
