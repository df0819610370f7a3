//! Harvester for VIVO-style SPARQL query endpoints.
//!
//! Each instance owns its HTTP client and credentials, so two harvesters for
//! different endpoints (or the same one) never share request state.
//!
//! Paging runs over distinct subject URIs; the details of one page are then
//! fetched in a single query and folded into one record per URI.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::config::SparqlConfig;
use crate::harvest::paginate::{paginate, PagedSource};
use crate::harvest::providers::{classify_status, http_client, lookback_days};
use crate::model::{HarvestWindow, HarvestedRecord};
use crate::traits::{HarvestError, Harvester, RecordStream};

const RESULTS_MIME: &str = "application/sparql-results+json";

const PREFIXES: &str = "\
PREFIX vivo: <http://vivoweb.org/ontology/core#>
PREFIX bibo: <http://purl.org/ontology/bibo/>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
PREFIX xsd: <http://www.w3.org/2001/XMLSchema#>
";

/// Multi-valued fields collected per URI, in payload order.
const DETAIL_FIELDS: [&str; 3] = ["doi", "title", "date"];

/// SPARQL 1.1 JSON results document.
#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<BTreeMap<String, SparqlTerm>>,
}

#[derive(Debug, Deserialize)]
struct SparqlTerm {
    value: String,
}

pub struct SparqlHarvester {
    source: String,
    endpoint: String,
    email: Option<String>,
    password: Option<String>,
    page_size: usize,
    lookback: chrono::Duration,
    client: reqwest::Client,
}

impl SparqlHarvester {
    pub fn new(source: impl Into<String>, config: &SparqlConfig) -> Result<Self, HarvestError> {
        Ok(Self {
            source: source.into(),
            endpoint: config.endpoint.clone(),
            email: config.email.clone(),
            password: config.password.clone(),
            page_size: config.page_size,
            lookback: lookback_days(config.lookback_days)?,
            client: http_client(config.request_timeout_secs)?,
        })
    }

    async fn query(&self, query: &str) -> Result<SparqlResponse, HarvestError> {
        let mut params = vec![("query", query)];
        if let Some(email) = &self.email {
            params.push(("email", email.as_str()));
        }
        if let Some(password) = &self.password {
            params.push(("password", password.as_str()));
        }

        debug!(endpoint = %self.endpoint, "Querying SPARQL endpoint");

        let response = self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::ACCEPT, RESULTS_MIME)
            .query(&params)
            .send()
            .await
            .map_err(|e| HarvestError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| HarvestError::Network(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| HarvestError::Parse(e.to_string()))
    }
}

fn xsd_datetime(value: chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "\"{}\"^^xsd:dateTime",
        value.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

fn window_filter(window: &HarvestWindow) -> String {
    format!(
        "?uri vivo:dateTimeValue ?dateNode .\n  \
         ?dateNode vivo:dateTime ?date .\n  \
         FILTER (?date >= {} && ?date < {})",
        xsd_datetime(window.start),
        xsd_datetime(window.end)
    )
}

pub(crate) fn total_query(window: &HarvestWindow) -> String {
    format!(
        "{PREFIXES}SELECT (COUNT(DISTINCT ?uri) AS ?total) WHERE {{\n  {}\n}}",
        window_filter(window)
    )
}

/// One row per subject, so `LIMIT`/`OFFSET` step in the unit `total` counts.
pub(crate) fn uris_query(window: &HarvestWindow, limit: usize, offset: usize) -> String {
    format!(
        "{PREFIXES}SELECT DISTINCT ?uri WHERE {{\n  {}\n}}\n\
         ORDER BY ?uri\nLIMIT {limit}\nOFFSET {offset}",
        window_filter(window)
    )
}

pub(crate) fn details_query(uris: &[String]) -> Result<String, HarvestError> {
    let mut values = String::new();
    for uri in uris {
        if uri.chars().any(|c| c.is_whitespace() || "<>\"{}|^`\\".contains(c)) {
            return Err(HarvestError::Parse(format!("'{uri}' is not a valid IRI")));
        }
        values.push_str(&format!(" <{uri}>"));
    }

    Ok(format!(
        "{PREFIXES}SELECT ?uri ?doi ?title ?date WHERE {{\n  \
         VALUES ?uri {{{values} }}\n  \
         OPTIONAL {{ ?uri vivo:dateTimeValue ?dateNode . ?dateNode vivo:dateTime ?date }}\n  \
         OPTIONAL {{ ?uri bibo:doi ?doi }}\n  \
         OPTIONAL {{ ?uri rdfs:label ?title }}\n}}"
    ))
}

fn parse_total(response: &SparqlResponse) -> Result<usize, HarvestError> {
    let term = response
        .results
        .bindings
        .first()
        .and_then(|row| row.get("total"))
        .ok_or_else(|| HarvestError::Parse("count query returned no total".to_string()))?;

    term.value
        .parse()
        .map_err(|_| HarvestError::Parse(format!("total '{}' is not a count", term.value)))
}

fn uris_from_bindings(response: SparqlResponse) -> Result<Vec<String>, HarvestError> {
    response
        .results
        .bindings
        .into_iter()
        .map(|mut row| {
            row.remove("uri")
                .map(|term| term.value)
                .ok_or_else(|| HarvestError::Parse("result row without ?uri".to_string()))
        })
        .collect()
}

/// Folds detail rows into one record per URI of `uris`, in that order.
///
/// Every field is a sorted array of distinct values, so the payload does not
/// depend on the row order the endpoint happens to return. The record is
/// identified by its DOI when it has exactly one, by its URI otherwise.
fn records_from_details(
    uris: &[String],
    response: SparqlResponse,
) -> Result<Vec<HarvestedRecord>, HarvestError> {
    let mut details: BTreeMap<String, BTreeMap<&str, BTreeSet<String>>> = BTreeMap::new();
    for mut row in response.results.bindings {
        let uri = row
            .remove("uri")
            .ok_or_else(|| HarvestError::Parse("result row without ?uri".to_string()))?
            .value;
        let fields = details.entry(uri).or_default();
        for name in DETAIL_FIELDS {
            if let Some(term) = row.remove(name) {
                fields.entry(name).or_default().insert(term.value);
            }
        }
    }

    let records = uris
        .iter()
        .map(|uri| {
            let mut fields = details.remove(uri).unwrap_or_default();
            let mut payload = json!({ "uri": uri });
            for name in DETAIL_FIELDS {
                let values: Vec<Value> = fields
                    .remove(name)
                    .unwrap_or_default()
                    .into_iter()
                    .map(Value::String)
                    .collect();
                payload[name] = Value::Array(values);
            }

            let provider_id = match payload["doi"].as_array().map(Vec::as_slice) {
                Some([Value::String(doi)]) => doi.clone(),
                _ => uri.clone(),
            };
            HarvestedRecord::json(provider_id, &payload)
        })
        .collect();

    Ok(records)
}

#[async_trait]
impl PagedSource for SparqlHarvester {
    fn page_size(&self) -> usize {
        self.page_size
    }

    #[instrument(skip(self), fields(source = %self.source))]
    async fn get_total(&self, window: &HarvestWindow) -> Result<usize, HarvestError> {
        let response = self.query(&total_query(window)).await?;
        parse_total(&response)
    }

    async fn get_page(
        &self,
        window: &HarvestWindow,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HarvestedRecord>, HarvestError> {
        let uris = uris_from_bindings(self.query(&uris_query(window, limit, offset)).await?)?;
        if uris.is_empty() {
            return Ok(Vec::new());
        }

        let response = self.query(&details_query(&uris)?).await?;
        records_from_details(&uris, response)
    }
}

impl Harvester for SparqlHarvester {
    fn source(&self) -> &str {
        &self.source
    }

    fn default_lookback(&self) -> chrono::Duration {
        self.lookback
    }

    fn harvest(&self, window: HarvestWindow) -> RecordStream<'_> {
        paginate(self, window)
    }
}
