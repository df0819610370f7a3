//! Bundled normalizer and graph sink.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{json, Value};

use crate::model::{NormalizedGraph, RawRecord, RawRecordId, RecordFormat};
use crate::traits::{GraphSink, NormalizeError, Normalizer, SinkError};

/// Wraps a JSON payload as the single node of a graph, keyed by the
/// provider id. Field mapping is left to downstream consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonNormalizer;

#[async_trait]
impl Normalizer for JsonNormalizer {
    async fn normalize(&self, raw: &RawRecord) -> Result<NormalizedGraph, NormalizeError> {
        if raw.format != RecordFormat::Json {
            return Err(NormalizeError::Malformed(format!(
                "{} is {:?}, expected JSON",
                raw.id, raw.format
            )));
        }

        let attributes: serde_json::Value = serde_json::from_slice(&raw.payload)
            .map_err(|e| NormalizeError::Malformed(format!("{}: {}", raw.id, e)))?;

        Ok(NormalizedGraph {
            raw_id: raw.id,
            source: raw.source.clone(),
            graph: json!({
                "@graph": [{
                    "@id": raw.provider_id,
                    "@type": "CreativeWork",
                    "attributes": attributes,
                }]
            }),
        })
    }
}

/// Wraps an XML element as the single node of a graph.
///
/// Each child element of the root becomes an attribute holding its text; a
/// child name that repeats becomes an array in document order.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlNormalizer;

#[async_trait]
impl Normalizer for XmlNormalizer {
    async fn normalize(&self, raw: &RawRecord) -> Result<NormalizedGraph, NormalizeError> {
        if raw.format != RecordFormat::Xml {
            return Err(NormalizeError::Malformed(format!(
                "{} is {:?}, expected XML",
                raw.id, raw.format
            )));
        }

        let attributes = xml_attributes(&raw.payload)
            .map_err(|e| NormalizeError::Malformed(format!("{}: {}", raw.id, e)))?;

        Ok(NormalizedGraph {
            raw_id: raw.id,
            source: raw.source.clone(),
            graph: json!({
                "@graph": [{
                    "@id": raw.provider_id,
                    "@type": "CreativeWork",
                    "attributes": attributes,
                }]
            }),
        })
    }
}

fn xml_attributes(payload: &[u8]) -> Result<Value, String> {
    let document = std::str::from_utf8(payload).map_err(|e| e.to_string())?;
    let mut reader = Reader::from_str(document);

    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut field: Option<(String, String)> = None;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) => {
                depth += 1;
                saw_root = true;
                if depth == 2 {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    field = Some((name, String::new()));
                }
            }
            Event::Empty(e) => {
                saw_root = true;
                if depth == 1 {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    fields.entry(name).or_default().push(String::new());
                }
            }
            Event::Text(e) => {
                if let Some((_, value)) = field.as_mut() {
                    value.push_str(&e.unescape().map_err(|e| e.to_string())?);
                }
            }
            Event::CData(e) => {
                if let Some((_, value)) = field.as_mut() {
                    value.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    if let Some((name, value)) = field.take() {
                        fields.entry(name).or_default().push(value.trim().to_string());
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root || depth != 0 {
        return Err("payload is not a complete XML element".to_string());
    }

    let attributes = fields
        .into_iter()
        .map(|(name, mut values)| {
            let value = if values.len() == 1 {
                Value::String(values.remove(0))
            } else {
                Value::Array(values.into_iter().map(Value::String).collect())
            };
            (name, value)
        })
        .collect();
    Ok(Value::Object(attributes))
}

/// Keeps every accepted graph in memory.
#[derive(Debug, Default)]
pub struct MemoryGraphSink {
    graphs: Mutex<Vec<NormalizedGraph>>,
}

impl MemoryGraphSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graphs(&self) -> Vec<NormalizedGraph> {
        self.graphs
            .lock()
            .map(|graphs| graphs.clone())
            .unwrap_or_default()
    }

    pub fn raw_ids(&self) -> Vec<RawRecordId> {
        let mut ids: Vec<_> = self.graphs().iter().map(|g| g.raw_id).collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl GraphSink for MemoryGraphSink {
    async fn accept(&self, graph: NormalizedGraph) -> Result<(), SinkError> {
        self.graphs
            .lock()
            .map_err(|_| SinkError("graph buffer poisoned".to_string()))?
            .push(graph);
        Ok(())
    }
}
