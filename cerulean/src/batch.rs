//! Entity group transactions: single-partition, all-or-nothing batches

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use uuid::Uuid;

use crate::codec;
use crate::entity::TableEntity;
use crate::error::TableError;
use crate::resource::format_resource;
use crate::transport::{BatchResponse, RestApi};

/// The service's limit on operations per transaction.
pub const MAX_BATCH_OPERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Accumulating,
    Committed,
    Failed,
}

#[derive(Debug)]
struct BatchOperation {
    entity: Option<TableEntity>,
    method: &'static str,
    resource: String,
    headers: Vec<(String, String)>,
}

/// A transaction of operations against entities sharing one partition key,
/// submitted as a single multipart request and applied atomically.
///
/// The first queued operation fixes the partition key; queueing an operation
/// for another partition, or a second operation on a row already in the
/// transaction, fails immediately without touching the network. After a
/// commit (successful or not) the transaction cannot be reused.
pub struct TableBatch {
    table_name: String,
    rest: Arc<dyn RestApi>,
    partition_key: Option<String>,
    modified_rows: HashSet<String>,
    operations: Vec<BatchOperation>,
    state: BatchState,
}

impl TableBatch {
    pub(crate) fn new(table_name: String, rest: Arc<dyn RestApi>) -> Self {
        Self {
            table_name,
            rest,
            partition_key: None,
            modified_rows: HashSet::new(),
            operations: Vec::new(),
            state: BatchState::Accumulating,
        }
    }

    /// The partition key fixed by the first queued operation, if any.
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn is_committed(&self) -> bool {
        self.state == BatchState::Committed
    }

    /// Queue an insert (POST on the table resource).
    pub fn insert(&mut self, entity: TableEntity) -> Result<(), TableError> {
        self.validate(entity.partition_key(), entity.row_key())?;
        let resource = self.table_name.clone();
        self.operations.push(BatchOperation {
            entity: Some(entity),
            method: "POST",
            resource,
            headers: Vec::new(),
        });
        Ok(())
    }

    /// Queue an unconditional upsert (PUT without a precondition).
    pub fn insert_or_update(&mut self, entity: TableEntity) -> Result<(), TableError> {
        self.validate(entity.partition_key(), entity.row_key())?;
        let resource = self.entity_resource(&entity);
        self.operations.push(BatchOperation {
            entity: Some(entity),
            method: "PUT",
            resource,
            headers: Vec::new(),
        });
        Ok(())
    }

    /// Queue a full replace, conditional on the entity's ETag unless
    /// `unconditional` is set.
    pub fn update(&mut self, entity: TableEntity, unconditional: bool) -> Result<(), TableError> {
        self.queue_conditional(entity, "PUT", unconditional)
    }

    /// Queue a partial update, conditional on the entity's ETag unless
    /// `unconditional` is set.
    pub fn merge(&mut self, entity: TableEntity, unconditional: bool) -> Result<(), TableError> {
        self.queue_conditional(entity, "MERGE", unconditional)
    }

    /// Queue a delete of the given entity, conditional on its ETag unless
    /// `unconditional` is set.
    pub fn delete(&mut self, entity: &TableEntity, unconditional: bool) -> Result<(), TableError> {
        let etag = if unconditional { None } else { entity.etag() };
        self.delete_keys(entity.partition_key(), entity.row_key(), etag)
    }

    /// Queue a delete by keys. Without an ETag the delete is unconditional.
    pub fn delete_keys(
        &mut self,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<(), TableError> {
        self.validate(partition_key, row_key)?;
        let resource = format_resource(&self.table_name, Some(partition_key), Some(row_key));
        self.operations.push(BatchOperation {
            entity: None,
            method: "DELETE",
            resource,
            headers: vec![("If-Match".to_string(), etag.unwrap_or("*").to_string())],
        });
        Ok(())
    }

    fn queue_conditional(
        &mut self,
        entity: TableEntity,
        method: &'static str,
        unconditional: bool,
    ) -> Result<(), TableError> {
        self.validate(entity.partition_key(), entity.row_key())?;

        let if_match = if unconditional {
            "*".to_string()
        } else {
            entity.etag().ok_or(TableError::MissingEtag)?.to_string()
        };

        let resource = self.entity_resource(&entity);
        self.operations.push(BatchOperation {
            entity: Some(entity),
            method,
            resource,
            headers: vec![("If-Match".to_string(), if_match)],
        });
        Ok(())
    }

    fn entity_resource(&self, entity: &TableEntity) -> String {
        format_resource(
            &self.table_name,
            Some(entity.partition_key()),
            Some(entity.row_key()),
        )
    }

    fn validate(&mut self, partition_key: &str, row_key: &str) -> Result<(), TableError> {
        if self.state != BatchState::Accumulating {
            return Err(TableError::Batch(
                "the transaction has already been committed".to_string(),
            ));
        }

        match &self.partition_key {
            None => self.partition_key = Some(partition_key.to_string()),
            Some(existing) if existing != partition_key => {
                return Err(TableError::Batch(format!(
                    "all operations must share one partition key: expected {existing:?}, found {partition_key:?}"
                )));
            }
            Some(_) => {}
        }

        if !self.modified_rows.insert(row_key.to_string()) {
            return Err(TableError::Batch(format!(
                "multiple operations on row {row_key:?} are not supported in the same transaction"
            )));
        }

        Ok(())
    }

    /// Commit the transaction, raising on any failure.
    ///
    /// The service applies the batch atomically: either every operation is
    /// applied or none is. On success each queued entity's ETag is refreshed
    /// from its sub-response. Committing an empty transaction is a no-op.
    pub async fn commit(&mut self) -> Result<(), TableError> {
        self.ensure_accumulating()?;

        if self.operations.is_empty() {
            self.state = BatchState::Committed;
            return Ok(());
        }

        let response = self.send().await?;

        if let Err(error) = response.ensure_succeeded() {
            self.state = BatchState::Failed;
            return Err(error);
        }

        self.apply_etags(&response);
        self.state = BatchState::Committed;
        Ok(())
    }

    /// Commit, converting a precondition failure into `Ok(false)`.
    ///
    /// A `false` return means some entity's ETag was stale; the whole batch
    /// was rejected and the caller is free to re-read and retry. Any other
    /// failure still raises.
    pub async fn try_commit(&mut self) -> Result<bool, TableError> {
        self.ensure_accumulating()?;

        if self.operations.is_empty() {
            self.state = BatchState::Committed;
            return Ok(true);
        }

        let response = self.send().await?;

        if !(200..300).contains(&response.status) {
            self.state = BatchState::Failed;
            return Err(TableError::protocol(response.status, &response.body));
        }

        if response.failed_precondition().is_some() {
            self.state = BatchState::Failed;
            return Ok(false);
        }

        if let Err(error) = response.ensure_succeeded() {
            self.state = BatchState::Failed;
            return Err(error);
        }

        self.apply_etags(&response);
        self.state = BatchState::Committed;
        Ok(true)
    }

    /// The queued entities, in queue order (deletes carry none).
    pub fn entities(&self) -> impl Iterator<Item = &TableEntity> {
        self.operations.iter().filter_map(|op| op.entity.as_ref())
    }

    /// Consume the transaction, returning the queued entities. After a
    /// successful commit their ETags reflect the committed versions.
    pub fn into_entities(self) -> Vec<TableEntity> {
        self.operations
            .into_iter()
            .filter_map(|op| op.entity)
            .collect()
    }

    fn ensure_accumulating(&self) -> Result<(), TableError> {
        if self.state == BatchState::Accumulating {
            Ok(())
        } else {
            Err(TableError::Batch(
                "the transaction has already been committed".to_string(),
            ))
        }
    }

    async fn send(&mut self) -> Result<BatchResponse, TableError> {
        let batch_boundary = format!("batch_{}", Uuid::new_v4());
        let changeset_boundary = format!("changeset_{}", Uuid::new_v4());
        let body = self.encode_body(&batch_boundary, &changeset_boundary)?;

        debug!(
            "committing batch of {} operations on partition {:?}",
            self.operations.len(),
            self.partition_key.as_deref().unwrap_or_default()
        );

        self.rest.batch(&batch_boundary, body).await
    }

    /// Encode the queued operations as a multipart/mixed body: the outer
    /// batch part wraps one changeset, each operation an embedded HTTP
    /// sub-request with its queue index as `Content-ID`.
    fn encode_body(
        &self,
        batch_boundary: &str,
        changeset_boundary: &str,
    ) -> Result<Vec<u8>, TableError> {
        let mut body = MultipartWriter::new();

        body.boundary(batch_boundary);
        body.header(
            "Content-Type",
            &format!("multipart/mixed; boundary={changeset_boundary}"),
        );
        body.blank();

        for (index, operation) in self.operations.iter().enumerate() {
            body.boundary(changeset_boundary);
            body.header("Content-Type", "application/http");
            body.header("Content-Transfer-Encoding", "binary");
            body.blank();

            body.line(&format!(
                "{} {} HTTP/1.1",
                operation.method,
                self.rest.format_url(&operation.resource)
            ));
            body.header("Content-ID", &index.to_string());

            let content = operation
                .entity
                .as_ref()
                .map(codec::serialize)
                .transpose()?;
            if let Some(content) = &content {
                body.header("Content-Type", "application/atom+xml;type=entry");
                body.header("Content-Length", &content.len().to_string());
            }
            for (name, value) in &operation.headers {
                body.header(name, value);
            }
            body.blank();

            if let Some(content) = content {
                body.line(&content);
            }
        }

        body.end_boundary(changeset_boundary);
        body.end_boundary(batch_boundary);

        Ok(body.into_bytes())
    }

    fn apply_etags(&mut self, response: &BatchResponse) {
        for (position, op_response) in response.operations.iter().enumerate() {
            let index = op_response.content_id.unwrap_or(position);
            let Some(operation) = self.operations.get_mut(index) else {
                continue;
            };

            // deletes have no entity to refresh
            if matches!(operation.method, "POST" | "PUT" | "MERGE") {
                if let Some(entity) = operation.entity.as_mut() {
                    if let Some(etag) = op_response.header("etag") {
                        entity.set_etag(Some(codec::url_decode(etag)));
                    }
                }
            }
        }
    }
}

/// `\r\n`-framed multipart body writer.
struct MultipartWriter {
    buffer: String,
}

impl MultipartWriter {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn boundary(&mut self, boundary: &str) {
        self.line(&format!("--{boundary}"));
    }

    fn end_boundary(&mut self, boundary: &str) {
        self.line(&format!("--{boundary}--"));
    }

    fn header(&mut self, name: &str, value: &str) {
        self.line(&format!("{name}: {value}"));
    }

    fn blank(&mut self) {
        self.buffer.push_str("\r\n");
    }

    fn line(&mut self, line: &str) {
        self.buffer.push_str(line);
        self.buffer.push_str("\r\n");
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buffer.into_bytes()
    }
}
