//! Cerulean: a client library for Azure Table Storage
//!
//! This crate implements the table service's AtomPub/OData protocol:
//! schemaless entities with typed fields, the XML wire codec, shared-key
//! request signing, pluggable retry policies, single-partition entity group
//! transactions, and continuation-driven queries with optimistic
//! concurrency.
//!
//! # Example
//!
//! ```no_run
//! use cerulean::{TableClient, TableEntity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cerulean::TableError> {
//!     let client = TableClient::from_connection_string(
//!         "AccountName=myaccount;AccountKey=c2VjcmV0",
//!     )?;
//!     client.try_create_table("People").await?;
//!
//!     let table = client.table("People")?;
//!     let mut entity = TableEntity::new("smith", "john")?;
//!     entity.set("Age", 34)?;
//!     table.insert(&entity).await?;
//!
//!     // optimistic read-modify-write loop
//!     loop {
//!         let mut current = table.query().partition("smith").row("john").fetch().await?.remove(0);
//!         let age = current.get("Age").and_then(|v| v.as_i32()).unwrap_or(0);
//!         current.set("Age", age + 1)?;
//!         if table.try_update(&mut current).await? {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod batch;
pub mod client;
pub mod codec;
pub mod entity;
pub mod error;
pub mod resource;
pub mod retry;
pub mod table;
pub mod transport;

pub use auth::Account;
pub use batch::{MAX_BATCH_OPERATIONS, TableBatch};
pub use client::TableClient;
pub use entity::{FieldValue, TableEntity};
pub use error::TableError;
pub use resource::ConnectionConfig;
pub use retry::{FixedRetry, NoRetries, RetryPolicy};
pub use table::{QueryBuilder, Table};
pub use transport::{BatchResponse, OperationResponse, RestApi, RestClient, RestResponse};
