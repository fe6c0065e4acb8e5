//! AtomPub XML codec for table entities
//!
//! Entities travel as Atom `<entry>` documents with a typed-properties block.
//! Non-string properties carry an explicit `m:type` attribute; strings are
//! the untagged default. The envelope's `updated` element is presentation
//! metadata written fresh on every serialization and carries no entity state.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use roxmltree::{Document, Node};
use uuid::Uuid;

use crate::entity::{FieldValue, TableEntity};
use crate::error::TableError;

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
const DATA_NS: &str = "http://schemas.microsoft.com/ado/2007/08/dataservices";
const META_NS: &str = "http://schemas.microsoft.com/ado/2007/08/dataservices/metadata";

/// Serialize an entity to its wire envelope.
pub fn serialize(entity: &TableEntity) -> Result<String, TableError> {
    serialize_with_fields(entity, None)
}

/// Serialize an entity, restricting the transmitted fields to an allowlist.
///
/// The keys are always written; `ETag` and `Timestamp` never are (they are
/// envelope- and transport-level, not properties).
pub fn serialize_with_fields(
    entity: &TableEntity,
    fields: Option<&[&str]>,
) -> Result<String, TableError> {
    let mut writer = Writer::new(Vec::new());

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))
        .map_err(xml_error)?;

    let mut entry = BytesStart::new("entry");
    entry.push_attribute(("xmlns:d", DATA_NS));
    entry.push_attribute(("xmlns:m", META_NS));
    entry.push_attribute(("xmlns", ATOM_NS));
    writer.write_event(Event::Start(entry)).map_err(xml_error)?;

    writer
        .write_event(Event::Empty(BytesStart::new("title")))
        .map_err(xml_error)?;
    write_text_element(
        &mut writer,
        "updated",
        &Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true),
    )?;
    writer
        .write_event(Event::Start(BytesStart::new("author")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Empty(BytesStart::new("name")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new("author")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Empty(BytesStart::new("id")))
        .map_err(xml_error)?;

    let mut content = BytesStart::new("content");
    content.push_attribute(("type", "application/xml"));
    writer.write_event(Event::Start(content)).map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("m:properties")))
        .map_err(xml_error)?;

    // absent keys (table-management entries) are skipped, not written empty
    if !entity.partition_key().is_empty() {
        write_property(&mut writer, "PartitionKey", &FieldValue::from(entity.partition_key()))?;
    }
    if !entity.row_key().is_empty() {
        write_property(&mut writer, "RowKey", &FieldValue::from(entity.row_key()))?;
    }

    for (name, value) in entity.fields() {
        if let Some(allowed) = fields {
            if !allowed.contains(&name.as_str()) {
                continue;
            }
        }
        write_property(&mut writer, name, value)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("m:properties")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new("content")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new("entry")))
        .map_err(xml_error)?;

    String::from_utf8(writer.into_inner()).map_err(|e| TableError::Xml(e.to_string()))
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<(), TableError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)?;
    Ok(())
}

fn write_property<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    value: &FieldValue,
) -> Result<(), TableError> {
    let qualified = format!("d:{name}");
    let mut start = BytesStart::new(qualified.clone());
    if let Some(edm_type) = value.edm_type() {
        start.push_attribute(("m:type", edm_type));
    }

    writer.write_event(Event::Start(start)).map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(&format_value(value))))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(qualified)))
        .map_err(xml_error)?;
    Ok(())
}

fn format_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => String::new(),
        FieldValue::Binary(bytes) => BASE64.encode(bytes),
        FieldValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        FieldValue::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        FieldValue::Double(d) => d.to_string(),
        FieldValue::Guid(g) => g.to_string(),
        FieldValue::Int32(i) => i.to_string(),
        FieldValue::Int64(i) => i.to_string(),
        FieldValue::String(s) => s.clone(),
    }
}

fn xml_error(error: impl std::fmt::Display) -> TableError {
    TableError::Xml(error.to_string())
}

/// Deserialize a single-entity response (the document root is the entry).
pub fn deserialize_entity(xml: &str) -> Result<TableEntity, TableError> {
    let document = Document::parse(xml).map_err(xml_error)?;
    entity_from_entry(document.root_element())
}

/// Deserialize a feed response into its entries, in server order.
pub fn deserialize_feed(xml: &str) -> Result<Vec<TableEntity>, TableError> {
    let document = Document::parse(xml).map_err(xml_error)?;

    document
        .root_element()
        .children()
        .filter(|node| node.is_element() && node.tag_name().name() == "entry")
        .map(entity_from_entry)
        .collect()
}

fn entity_from_entry(entry: Node) -> Result<TableEntity, TableError> {
    let etag = entry
        .attribute((META_NS, "etag"))
        .map(|raw| url_decode(raw));

    let properties = entry
        .children()
        .find(|node| node.is_element() && node.tag_name().name() == "content")
        .and_then(|content| {
            content
                .children()
                .find(|node| node.is_element() && node.tag_name().name() == "properties")
        })
        .ok_or_else(|| TableError::Xml("entry has no content/properties block".to_string()))?;

    let mut partition_key = String::new();
    let mut row_key = String::new();
    let mut timestamp = None;
    let mut fields = BTreeMap::new();

    for item in properties.children().filter(|node| node.is_element()) {
        if item.attribute((META_NS, "null")) == Some("true") {
            continue;
        }

        let name = item.tag_name().name();
        let value = parse_property(item)?;

        match name {
            "PartitionKey" => {
                partition_key = value.as_str().unwrap_or_default().to_string();
            }
            "RowKey" => {
                row_key = value.as_str().unwrap_or_default().to_string();
            }
            "Timestamp" => {
                timestamp = value.as_datetime();
            }
            _ => {
                fields.insert(name.to_string(), value);
            }
        }
    }

    Ok(TableEntity::from_parts(
        partition_key,
        row_key,
        etag,
        timestamp,
        fields,
    ))
}

fn parse_property(item: Node) -> Result<FieldValue, TableError> {
    let text = item.text().unwrap_or_default();

    let value = match item.attribute((META_NS, "type")) {
        None => FieldValue::String(text.to_string()),
        Some("Edm.Binary") => FieldValue::Binary(
            BASE64
                .decode(text)
                .map_err(|e| bad_property(item, "Edm.Binary", &e))?,
        ),
        Some("Edm.Boolean") => FieldValue::Bool(
            text.parse()
                .map_err(|e| bad_property(item, "Edm.Boolean", &e))?,
        ),
        Some("Edm.DateTime") => FieldValue::DateTime(parse_datetime(text).ok_or_else(|| {
            TableError::Xml(format!(
                "property {:?}: invalid Edm.DateTime value {text:?}",
                item.tag_name().name()
            ))
        })?),
        Some("Edm.Double") => FieldValue::Double(
            text.parse()
                .map_err(|e| bad_property(item, "Edm.Double", &e))?,
        ),
        Some("Edm.Guid") => FieldValue::Guid(
            Uuid::parse_str(text).map_err(|e| bad_property(item, "Edm.Guid", &e))?,
        ),
        Some("Edm.Int32") => FieldValue::Int32(
            text.parse()
                .map_err(|e| bad_property(item, "Edm.Int32", &e))?,
        ),
        Some("Edm.Int64") => FieldValue::Int64(
            text.parse()
                .map_err(|e| bad_property(item, "Edm.Int64", &e))?,
        ),
        // unknown tags fall back to the raw string
        Some(_) => FieldValue::String(text.to_string()),
    };

    Ok(value)
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn bad_property(item: Node, edm_type: &str, error: &impl std::fmt::Display) -> TableError {
    TableError::Xml(format!(
        "property {:?}: invalid {edm_type} value: {error}",
        item.tag_name().name()
    ))
}

pub(crate) fn url_decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
