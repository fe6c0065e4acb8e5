//! Table operations: CRUD with optimistic concurrency and paged queries

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::batch::{MAX_BATCH_OPERATIONS, TableBatch};
use crate::codec;
use crate::entity::TableEntity;
use crate::error::TableError;
use crate::resource::{format_query, format_resource};
use crate::transport::{RestApi, RestResponse};

const NEXT_PARTITION_HEADER: &str = "x-ms-continuation-NextPartitionKey";
const NEXT_ROW_HEADER: &str = "x-ms-continuation-NextRowKey";

/// Operations on the entities of one table.
///
/// Conditional writes send the entity's current ETag as `If-Match` (or `*`
/// when unconditional) and refresh it from the response; `try_` variants
/// convert the expected contention outcomes (duplicate key on insert, stale
/// ETag on update/merge) into non-exceptional results so callers can drive
/// read-modify-write retry loops.
pub struct Table {
    name: String,
    rest: Arc<dyn RestApi>,
}

impl Table {
    pub(crate) fn new(name: String, rest: Arc<dyn RestApi>) -> Self {
        Self { name, rest }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start an entity group transaction on this table.
    pub fn batch(&self) -> TableBatch {
        TableBatch::new(self.name.clone(), self.rest.clone())
    }

    /// Start building a query against this table.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder {
            table: self,
            partition: None,
            row: None,
            filter: None,
            top: None,
            fields: Vec::new(),
            disable_continuation: false,
        }
    }

    /// Insert a new entity, returning the server's echo of it (with the
    /// assigned ETag and timestamp).
    pub async fn insert(&self, entity: &TableEntity) -> Result<TableEntity, TableError> {
        let document = codec::serialize(entity)?;
        let response = self.rest.post(&self.name, &document).await?;
        response.ensure_succeeded()?;

        codec::deserialize_entity(&response.body)
    }

    /// Insert a new entity, returning `None` when an entity with the same
    /// keys already exists.
    pub async fn try_insert(&self, entity: &TableEntity) -> Result<Option<TableEntity>, TableError> {
        let document = codec::serialize(entity)?;
        let response = self.rest.post(&self.name, &document).await?;

        if !response.succeeded() {
            let error = response.error();
            if error.is_conflict() {
                return Ok(None);
            }
            return Err(error);
        }

        Ok(Some(codec::deserialize_entity(&response.body)?))
    }

    /// Replace an existing entity, conditional on its ETag unless
    /// `unconditional` is set. The entity's ETag is refreshed on success.
    pub async fn update(&self, entity: &mut TableEntity, unconditional: bool) -> Result<(), TableError> {
        let if_match = precondition(entity, unconditional)?;
        let response = self.write(entity, false, Some(&if_match), &[]).await?;
        response.ensure_succeeded()?;
        refresh_etag(entity, &response);
        Ok(())
    }

    /// Replace an existing entity, returning `false` when its ETag is stale.
    pub async fn try_update(&self, entity: &mut TableEntity) -> Result<bool, TableError> {
        let if_match = precondition(entity, false)?;
        let response = self.write(entity, false, Some(&if_match), &[]).await?;
        self.finish_try_write(entity, response)
    }

    /// Merge fields into an existing entity, conditional on its ETag unless
    /// `unconditional` is set.
    ///
    /// A non-empty `fields` allowlist restricts which fields are transmitted;
    /// fields not listed keep their server-side values.
    pub async fn merge(
        &self,
        entity: &mut TableEntity,
        unconditional: bool,
        fields: &[&str],
    ) -> Result<(), TableError> {
        let if_match = precondition(entity, unconditional)?;
        let response = self.write(entity, true, Some(&if_match), fields).await?;
        response.ensure_succeeded()?;
        refresh_etag(entity, &response);
        Ok(())
    }

    /// Merge fields into an existing entity, returning `false` when its ETag
    /// is stale.
    pub async fn try_merge(&self, entity: &mut TableEntity, fields: &[&str]) -> Result<bool, TableError> {
        let if_match = precondition(entity, false)?;
        let response = self.write(entity, true, Some(&if_match), fields).await?;
        self.finish_try_write(entity, response)
    }

    /// Unconditional upsert: replace the entity or create it.
    pub async fn insert_or_update(&self, entity: &mut TableEntity) -> Result<(), TableError> {
        let response = self.write(entity, false, None, &[]).await?;
        response.ensure_succeeded()?;
        refresh_etag(entity, &response);
        Ok(())
    }

    /// Unconditional upsert merging fields: merge into the entity or create it.
    pub async fn insert_or_merge(&self, entity: &mut TableEntity, fields: &[&str]) -> Result<(), TableError> {
        let response = self.write(entity, true, None, fields).await?;
        response.ensure_succeeded()?;
        refresh_etag(entity, &response);
        Ok(())
    }

    /// Delete an entity, conditional on its ETag unless `unconditional` is
    /// set (entities without an ETag delete unconditionally).
    pub async fn delete(&self, entity: &TableEntity, unconditional: bool) -> Result<(), TableError> {
        let etag = if unconditional { None } else { entity.etag() };
        self.delete_keys(entity.partition_key(), entity.row_key(), etag).await
    }

    /// Delete an entity by keys. Without an ETag the delete is unconditional;
    /// deleting a missing entity fails with a not-found error.
    pub async fn delete_keys(
        &self,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
    ) -> Result<(), TableError> {
        let resource = format_resource(&self.name, Some(partition_key), Some(row_key));
        let response = self
            .rest
            .delete(&resource, Some(etag.unwrap_or("*")))
            .await?;
        response.ensure_succeeded()
    }

    /// Insert many entities using one transaction per partition chunk.
    ///
    /// Entities are grouped by partition key and committed in chunks of
    /// [`MAX_BATCH_OPERATIONS`]; the returned entities carry their assigned
    /// ETags.
    pub async fn batch_insert(&self, entities: Vec<TableEntity>) -> Result<Vec<TableEntity>, TableError> {
        let mut partitions: BTreeMap<String, Vec<TableEntity>> = BTreeMap::new();
        for entity in entities {
            partitions
                .entry(entity.partition_key().to_string())
                .or_default()
                .push(entity);
        }

        let mut inserted = Vec::new();
        for (_, rows) in partitions {
            let mut rows = rows.into_iter().peekable();
            while rows.peek().is_some() {
                let mut batch = self.batch();
                for entity in rows.by_ref().take(MAX_BATCH_OPERATIONS) {
                    batch.insert(entity)?;
                }
                batch.commit().await?;
                inserted.extend(batch.into_entities());
            }
        }

        Ok(inserted)
    }

    /// Drain the table's entire contents, batch-deleting per partition.
    pub async fn empty(&self) -> Result<(), TableError> {
        let entities = self.query().fetch().await?;
        debug!("emptying table {}: {} entities", self.name, entities.len());

        let mut partitions: BTreeMap<String, Vec<TableEntity>> = BTreeMap::new();
        for entity in entities {
            partitions
                .entry(entity.partition_key().to_string())
                .or_default()
                .push(entity);
        }

        for (_, rows) in partitions {
            for chunk in rows.chunks(MAX_BATCH_OPERATIONS) {
                let mut batch = self.batch();
                for entity in chunk {
                    batch.delete_keys(entity.partition_key(), entity.row_key(), None)?;
                }
                batch.commit().await?;
            }
        }

        Ok(())
    }

    async fn write(
        &self,
        entity: &TableEntity,
        merge: bool,
        if_match: Option<&str>,
        fields: &[&str],
    ) -> Result<RestResponse, TableError> {
        let resource = format_resource(&self.name, Some(entity.partition_key()), Some(entity.row_key()));
        let fields = if fields.is_empty() { None } else { Some(fields) };
        let document = codec::serialize_with_fields(entity, fields)?;

        if merge {
            self.rest.merge(&resource, &document, if_match).await
        } else {
            self.rest.put(&resource, &document, if_match).await
        }
    }

    fn finish_try_write(&self, entity: &mut TableEntity, response: RestResponse) -> Result<bool, TableError> {
        if !response.succeeded() {
            let error = response.error();
            if error.is_precondition_failure() {
                return Ok(false);
            }
            return Err(error);
        }

        refresh_etag(entity, &response);
        Ok(true)
    }

    async fn run_query(&self, query: QueryBuilder<'_>) -> Result<Vec<TableEntity>, TableError> {
        let single = query.partition.is_some() && query.row.is_some();
        let resource = format_resource(&self.name, query.partition.as_deref(), query.row.as_deref());
        let fields: Vec<String> = query.fields;
        let top = query.top.unwrap_or(0) as usize;

        if single {
            let query_string = format_query(
                query.partition.as_deref(),
                query.row.as_deref(),
                query.filter.as_deref(),
                query.top,
                &fields,
                None,
                None,
            );
            let response = self.rest.get(&resource, query_string.as_deref()).await?;

            // a missing entity is an empty result, not an error
            if response.status == crate::error::STATUS_NOT_FOUND {
                return Ok(Vec::new());
            }
            response.ensure_succeeded()?;

            return Ok(vec![codec::deserialize_entity(&response.body)?]);
        }

        let mut entities = Vec::new();
        let mut next_partition: Option<String> = None;
        let mut next_row: Option<String> = None;

        loop {
            let query_string = format_query(
                query.partition.as_deref(),
                query.row.as_deref(),
                query.filter.as_deref(),
                query.top,
                &fields,
                next_partition.as_deref(),
                next_row.as_deref(),
            );

            let response = self.rest.get(&resource, query_string.as_deref()).await?;
            response.ensure_succeeded()?;

            next_partition = response.header(NEXT_PARTITION_HEADER).map(str::to_string);
            next_row = response.header(NEXT_ROW_HEADER).map(str::to_string);
            let has_continuation = next_partition.is_some() || next_row.is_some();

            for entity in codec::deserialize_feed(&response.body)? {
                entities.push(entity);
                if top > 0 && entities.len() >= top {
                    break;
                }
            }

            let reached_top = top > 0 && entities.len() >= top;
            if query.disable_continuation || !has_continuation || reached_top {
                break;
            }
        }

        Ok(entities)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("name", &self.name).finish()
    }
}

fn precondition(entity: &TableEntity, unconditional: bool) -> Result<String, TableError> {
    if unconditional {
        return Ok("*".to_string());
    }
    entity
        .etag()
        .map(str::to_string)
        .ok_or(TableError::MissingEtag)
}

fn refresh_etag(entity: &mut TableEntity, response: &RestResponse) {
    if let Some(etag) = response.header("etag") {
        entity.set_etag(Some(codec::url_decode(etag)));
    }
}

/// Fluent query options: keys, filter, projection, page size and
/// continuation behavior.
///
/// With both `partition` and `row` set, [`QueryBuilder::fetch`] performs a
/// point lookup where a missing entity yields an empty result. Otherwise it
/// follows server continuation tokens until they run out, continuation is
/// disabled, or `top` entities have been accumulated.
#[derive(Debug)]
pub struct QueryBuilder<'a> {
    table: &'a Table,
    partition: Option<String>,
    row: Option<String>,
    filter: Option<String>,
    top: Option<u32>,
    fields: Vec<String>,
    disable_continuation: bool,
}

impl QueryBuilder<'_> {
    /// Restrict the query to one partition.
    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Restrict the query to one row key.
    pub fn row(mut self, row: impl Into<String>) -> Self {
        self.row = Some(row.into());
        self
    }

    /// An OData `$filter` expression, ANDed with any key predicate.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Maximum number of entities to return.
    pub fn top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    /// Project only the named fields (`$select`).
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Stop after the first page instead of following continuation tokens.
    pub fn no_continuation(mut self) -> Self {
        self.disable_continuation = true;
        self
    }

    /// Run the query, accumulating entities in server order.
    pub async fn fetch(self) -> Result<Vec<TableEntity>, TableError> {
        let table = self.table;
        table.run_query(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FieldValue;
    use crate::transport::testing::MockRest;

    const NAMESPACES: &str = r#"xmlns:d="http://schemas.microsoft.com/ado/2007/08/dataservices" xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata" xmlns="http://www.w3.org/2005/Atom""#;

    fn entry_doc(partition: &str, row: &str, etag: Option<&str>, field: &str) -> String {
        let etag_attr = etag
            .map(|e| format!(r#" m:etag="{e}""#))
            .unwrap_or_default();
        format!(
            r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<entry {NAMESPACES}{etag_attr}>
  <content type="application/xml">
    <m:properties>
      <d:PartitionKey>{partition}</d:PartitionKey>
      <d:RowKey>{row}</d:RowKey>
      <d:Field>{field}</d:Field>
    </m:properties>
  </content>
</entry>"#
        )
    }

    fn feed_doc(rows: &[(&str, &str)]) -> String {
        let entries: String = rows
            .iter()
            .map(|(partition, row)| {
                format!(
                    r#"<entry>
  <content type="application/xml">
    <m:properties>
      <d:PartitionKey>{partition}</d:PartitionKey>
      <d:RowKey>{row}</d:RowKey>
      <d:Field>value</d:Field>
    </m:properties>
  </content>
</entry>"#
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<feed {NAMESPACES}>
  <title type="text">People</title>
  {entries}
</feed>"#
        )
    }

    fn batch_ok(count: usize) -> String {
        let mut lines: Vec<String> = vec![
            "--batchresponse_x".to_string(),
            "Content-Type: multipart/mixed; boundary=changesetresponse_x".to_string(),
            String::new(),
        ];
        for id in 0..count {
            lines.push("--changesetresponse_x".to_string());
            lines.push("Content-Type: application/http".to_string());
            lines.push("Content-Transfer-Encoding: binary".to_string());
            lines.push(String::new());
            lines.push("HTTP/1.1 204 No Content".to_string());
            lines.push(format!("Content-ID: {id}"));
            lines.push(format!("ETag: W/\"batch-{id}\""));
            lines.push(String::new());
            lines.push(String::new());
        }
        lines.push("--changesetresponse_x--".to_string());
        lines.push("--batchresponse_x--".to_string());
        lines.join("\r\n")
    }

    fn table_over(rest: &Arc<MockRest>) -> Table {
        Table::new("People".to_string(), rest.clone() as Arc<dyn RestApi>)
    }

    fn entity_with_etag(partition: &str, row: &str, etag: &str) -> TableEntity {
        let mut e = TableEntity::new(partition, row).unwrap();
        e.set("Field", "value").unwrap();
        e.set_etag(Some(etag.to_string()));
        e
    }

    #[tokio::test]
    async fn test_point_query_not_found_is_empty() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(404, &[], r#"<error xmlns="ns"><code>ResourceNotFound</code><message>nope</message></error>"#);
        let table = table_over(&rest);

        let result = table.query().partition("p").row("r").fetch().await.unwrap();

        assert!(result.is_empty());
        let recorded = rest.recorded();
        assert_eq!(recorded[0].method, "GET");
        assert_eq!(recorded[0].resource, "People(PartitionKey='p',RowKey='r')");
    }

    #[tokio::test]
    async fn test_point_query_returns_one_entity() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(200, &[], &entry_doc("p", "r", Some("W/&quot;v1&quot;"), "v1"));
        let table = table_over(&rest);

        let result = table.query().partition("p").row("r").fetch().await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].partition_key(), "p");
        assert_eq!(result[0].row_key(), "r");
        assert_eq!(result[0].etag(), Some("W/\"v1\""));
        assert_eq!(result[0].get("Field").and_then(|v| v.as_str()), Some("v1"));
    }

    #[tokio::test]
    async fn test_query_follows_continuation_until_exhausted() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(
            200,
            &[
                ("x-ms-continuation-NextPartitionKey", "np1"),
                ("x-ms-continuation-NextRowKey", "nr1"),
            ],
            &feed_doc(&[("p1", "a"), ("p1", "b")]),
        );
        rest.push_response(
            200,
            &[("x-ms-continuation-NextPartitionKey", "np2")],
            &feed_doc(&[("p2", "c")]),
        );
        rest.push_response(200, &[], &feed_doc(&[("p3", "d")]));
        let table = table_over(&rest);

        let result = table.query().fetch().await.unwrap();

        // all pages accumulated, in server order, exactly once
        let keys: Vec<&str> = result.iter().map(|e| e.row_key()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);

        let recorded = rest.recorded();
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[0].query, None);
        assert_eq!(
            recorded[1].query.as_deref(),
            Some("NextPartitionKey=np1&NextRowKey=nr1")
        );
        assert_eq!(recorded[2].query.as_deref(), Some("NextPartitionKey=np2"));
    }

    #[tokio::test]
    async fn test_query_continuation_can_be_disabled() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(
            200,
            &[("x-ms-continuation-NextPartitionKey", "np")],
            &feed_doc(&[("p", "a")]),
        );
        let table = table_over(&rest);

        let result = table.query().no_continuation().fetch().await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(rest.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_query_stops_at_top_mid_page() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(
            200,
            &[("x-ms-continuation-NextPartitionKey", "np")],
            &feed_doc(&[("p", "a"), ("p", "b"), ("p", "c")]),
        );
        let table = table_over(&rest);

        let result = table.query().top(2).fetch().await.unwrap();

        assert_eq!(result.len(), 2);
        // the continuation is not followed once top is satisfied
        assert_eq!(rest.recorded().len(), 1);
        assert_eq!(rest.recorded()[0].query.as_deref(), Some("$top=2"));
    }

    #[tokio::test]
    async fn test_query_injects_partition_predicate() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(200, &[], &feed_doc(&[("p", "a")]));
        let table = table_over(&rest);

        table.query().partition("p").fetch().await.unwrap();

        let recorded = rest.recorded();
        assert_eq!(recorded[0].resource, "People");
        assert_eq!(
            recorded[0].query.as_deref(),
            Some("$filter=PartitionKey%20eq%20%27p%27")
        );
    }

    #[tokio::test]
    async fn test_insert_returns_server_entity() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(201, &[], &entry_doc("p", "r", Some("W/&quot;new&quot;"), "v1"));
        let table = table_over(&rest);

        let mut entity = TableEntity::new("p", "r").unwrap();
        entity.set("Field", "v1").unwrap();
        let inserted = table.insert(&entity).await.unwrap();

        assert_eq!(inserted.etag(), Some("W/\"new\""));

        let recorded = rest.recorded();
        assert_eq!(recorded[0].method, "POST");
        assert_eq!(recorded[0].resource, "People");
        assert!(recorded[0].content.as_deref().unwrap().contains("<d:Field>v1</d:Field>"));
    }

    #[tokio::test]
    async fn test_try_insert_conflict_is_none() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(
            409,
            &[],
            r#"<error xmlns="ns"><code>EntityAlreadyExists</code><message>dup</message></error>"#,
        );
        let table = table_over(&rest);

        let entity = TableEntity::new("p", "r").unwrap();
        assert!(table.try_insert(&entity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_sends_if_match_and_refreshes_etag() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(204, &[("ETag", "W/\"v2\"")], "");
        let table = table_over(&rest);

        let mut entity = entity_with_etag("p", "r", "W/\"v1\"");
        table.update(&mut entity, false).await.unwrap();

        assert_eq!(entity.etag(), Some("W/\"v2\""));

        let recorded = rest.recorded();
        assert_eq!(recorded[0].method, "PUT");
        assert_eq!(recorded[0].resource, "People(PartitionKey='p',RowKey='r')");
        assert_eq!(recorded[0].if_match.as_deref(), Some("W/\"v1\""));
    }

    #[tokio::test]
    async fn test_update_unconditional_sends_star() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(204, &[], "");
        let table = table_over(&rest);

        let mut entity = TableEntity::new("p", "r").unwrap();
        table.update(&mut entity, true).await.unwrap();

        assert_eq!(rest.recorded()[0].if_match.as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn test_update_with_stale_etag_raises_precondition_error() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(
            412,
            &[],
            r#"<error xmlns="ns"><code>UpdateConditionNotSatisfied</code><message>stale</message></error>"#,
        );
        let table = table_over(&rest);

        let mut entity = entity_with_etag("p", "r", "W/\"stale\"");
        let error = table.update(&mut entity, false).await.unwrap_err();

        assert!(error.is_precondition_failure());
    }

    #[tokio::test]
    async fn test_try_update_with_stale_etag_is_false() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(412, &[], "");
        let table = table_over(&rest);

        let mut entity = entity_with_etag("p", "r", "W/\"stale\"");
        assert!(!table.try_update(&mut entity).await.unwrap());
        // the stale token is left in place for the caller to refresh
        assert_eq!(entity.etag(), Some("W/\"stale\""));
    }

    #[tokio::test]
    async fn test_conditional_update_without_etag_fails_before_network() {
        let rest = Arc::new(MockRest::new());
        let table = table_over(&rest);

        let mut entity = TableEntity::new("p", "r").unwrap();
        assert!(matches!(
            table.update(&mut entity, false).await,
            Err(TableError::MissingEtag)
        ));
        assert!(rest.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_merge_with_allowlist_restricts_fields() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(204, &[("ETag", "W/\"v2\"")], "");
        let table = table_over(&rest);

        let mut entity = entity_with_etag("p", "r", "W/\"v1\"");
        entity.set("NotMerged", "untouched").unwrap();
        table.merge(&mut entity, false, &["Field"]).await.unwrap();

        let recorded = rest.recorded();
        assert_eq!(recorded[0].method, "MERGE");
        let content = recorded[0].content.as_deref().unwrap();
        assert!(content.contains("<d:Field>value</d:Field>"));
        assert!(!content.contains("NotMerged"));
    }

    #[tokio::test]
    async fn test_insert_or_update_sends_no_precondition() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(204, &[("ETag", "W/\"v1\"")], "");
        let table = table_over(&rest);

        let mut entity = TableEntity::new("p", "r").unwrap();
        table.insert_or_update(&mut entity).await.unwrap();

        let recorded = rest.recorded();
        assert_eq!(recorded[0].method, "PUT");
        assert_eq!(recorded[0].if_match, None);
        assert_eq!(entity.etag(), Some("W/\"v1\""));
    }

    #[tokio::test]
    async fn test_insert_or_merge_uses_merge_verb() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(204, &[], "");
        let table = table_over(&rest);

        let mut entity = TableEntity::new("p", "r").unwrap();
        entity.set("Field", "v").unwrap();
        table.insert_or_merge(&mut entity, &[]).await.unwrap();

        let recorded = rest.recorded();
        assert_eq!(recorded[0].method, "MERGE");
        assert_eq!(recorded[0].if_match, None);
    }

    #[tokio::test]
    async fn test_delete_uses_entity_etag() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(204, &[], "");
        let table = table_over(&rest);

        let entity = entity_with_etag("p", "r", "W/\"v1\"");
        table.delete(&entity, false).await.unwrap();

        let recorded = rest.recorded();
        assert_eq!(recorded[0].method, "DELETE");
        assert_eq!(recorded[0].if_match.as_deref(), Some("W/\"v1\""));
    }

    #[tokio::test]
    async fn test_delete_missing_entity_raises_not_found() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(
            404,
            &[],
            r#"<error xmlns="ns"><code>ResourceNotFound</code><message>gone</message></error>"#,
        );
        let table = table_over(&rest);

        let error = table.delete_keys("p", "r", None).await.unwrap_err();
        assert!(error.is_not_found());
        assert_eq!(rest.recorded()[0].if_match.as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn test_batch_insert_chunks_per_partition() {
        let rest = Arc::new(MockRest::new());
        // two partitions, each committed in its own transaction
        rest.push_response(202, &[], &batch_ok(2));
        rest.push_response(202, &[], &batch_ok(1));
        let table = table_over(&rest);

        let entities = vec![
            TableEntity::new("p1", "a").unwrap(),
            TableEntity::new("p1", "b").unwrap(),
            TableEntity::new("p2", "c").unwrap(),
        ];
        let inserted = table.batch_insert(entities).await.unwrap();

        assert_eq!(inserted.len(), 3);
        assert!(inserted.iter().all(|e| e.etag().is_some()));
        assert_eq!(rest.recorded().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_drains_all_partitions() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(200, &[], &feed_doc(&[("p1", "a"), ("p1", "b"), ("p2", "c")]));
        rest.push_response(202, &[], &batch_ok(2));
        rest.push_response(202, &[], &batch_ok(1));
        let table = table_over(&rest);

        table.empty().await.unwrap();

        let recorded = rest.recorded();
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[0].method, "GET");
        assert_eq!(recorded[1].method, "BATCH");
        assert_eq!(recorded[2].method, "BATCH");
        // unconditional deletes
        let content = recorded[1].content.as_deref().unwrap();
        assert!(content.contains("DELETE "));
        assert!(content.contains("If-Match: *"));
    }

    // bulk insert across partitions, then read everything back through
    // paged continuation: every row comes back exactly once
    #[tokio::test]
    async fn test_bulk_insert_then_paged_query_is_exhaustive() {
        let _ = env_logger::builder().is_test(true).try_init();

        let partitions: &[(&str, usize)] = &[("p1", 120), ("p2", 60), ("p3", 50)];
        let total: usize = partitions.iter().map(|(_, n)| n).sum();

        let rest = Arc::new(MockRest::new());
        // p1 commits in two chunks (the transaction cap), p2 and p3 in one each
        rest.push_response(202, &[], &batch_ok(MAX_BATCH_OPERATIONS));
        rest.push_response(202, &[], &batch_ok(20));
        rest.push_response(202, &[], &batch_ok(60));
        rest.push_response(202, &[], &batch_ok(50));

        // the read side pages arbitrarily: 100 + 100 + 30
        let mut all_rows: Vec<(String, String)> = partitions
            .iter()
            .flat_map(|(partition, count)| {
                (0..*count).map(move |i| (partition.to_string(), format!("row-{i:03}")))
            })
            .collect();
        all_rows.sort();
        for (page, continuation) in all_rows.chunks(100).zip(["np1", "np2", ""]) {
            let rows: Vec<(&str, &str)> = page
                .iter()
                .map(|(p, r)| (p.as_str(), r.as_str()))
                .collect();
            let headers: Vec<(&str, &str)> = if continuation.is_empty() {
                Vec::new()
            } else {
                vec![("x-ms-continuation-NextPartitionKey", continuation)]
            };
            rest.push_response(200, &headers, &feed_doc(&rows));
        }

        let table = table_over(&rest);

        let entities: Vec<TableEntity> = all_rows
            .iter()
            .map(|(partition, row)| TableEntity::new(partition.clone(), row.clone()).unwrap())
            .collect();
        let inserted = table.batch_insert(entities).await.unwrap();
        assert_eq!(inserted.len(), total);

        let fetched = table.query().fetch().await.unwrap();
        assert_eq!(fetched.len(), total);

        let unique: std::collections::HashSet<(String, String)> = fetched
            .iter()
            .map(|e| (e.partition_key().to_string(), e.row_key().to_string()))
            .collect();
        assert_eq!(unique.len(), total);

        // 4 batch commits + 3 query pages
        assert_eq!(rest.recorded().len(), 7);
    }

    // two writers race on one row: the first conditional write wins, the
    // second sees a deterministic precondition failure
    #[tokio::test]
    async fn test_concurrent_conditional_updates_one_winner() {
        let rest = Arc::new(MockRest::new());
        rest.push_response(204, &[("ETag", "W/\"v2\"")], "");
        rest.push_response(
            412,
            &[],
            r#"<error xmlns="ns"><code>UpdateConditionNotSatisfied</code><message>stale</message></error>"#,
        );
        let table = table_over(&rest);

        let mut first = entity_with_etag("p", "r", "W/\"v1\"");
        let mut second = entity_with_etag("p", "r", "W/\"v1\"");

        assert!(table.try_update(&mut first).await.unwrap());
        assert_eq!(first.etag(), Some("W/\"v2\""));

        assert!(!table.try_update(&mut second).await.unwrap());
    }

    // insert, read it back, update unconditionally, read the new value
    #[tokio::test]
    async fn test_insert_query_update_round_trip() -> anyhow::Result<()> {
        let rest = Arc::new(MockRest::new());
        rest.push_response(201, &[], &entry_doc("p", "r", Some("W/&quot;v1&quot;"), "v1"));
        rest.push_response(200, &[], &entry_doc("p", "r", Some("W/&quot;v1&quot;"), "v1"));
        rest.push_response(204, &[("ETag", "W/\"v2\"")], "");
        rest.push_response(200, &[], &entry_doc("p", "r", Some("W/&quot;v2&quot;"), "v2"));
        let table = table_over(&rest);

        let mut entity = TableEntity::new("p", "r")?;
        entity.set("Field", "v1")?;
        table.insert(&entity).await?;

        let mut found = table.query().partition("p").row("r").fetch().await?.remove(0);
        assert_eq!(found.get("Field").and_then(FieldValue::as_str), Some("v1"));

        found.set("Field", "v2")?;
        table.update(&mut found, true).await?;

        let after = table.query().partition("p").row("r").fetch().await?.remove(0);
        assert_eq!(after.get("Field").and_then(FieldValue::as_str), Some("v2"));
        Ok(())
    }
}
