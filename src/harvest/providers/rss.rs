//! Harvester for RSS feeds without date search, such as the IACR ePrint feed.
//!
//! Such a feed only lists its latest items, so every harvest fetches the
//! whole document. Items carrying a `pubDate` outside the window are skipped;
//! undated items are always kept. Each item is stored as its raw XML, keyed
//! by its `link`.

use std::collections::HashSet;

use async_stream::stream;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, info, warn};

use crate::config::RssConfig;
use crate::harvest::providers::{classify_status, http_client, lookback_days};
use crate::model::{HarvestWindow, HarvestedRecord};
use crate::traits::{HarvestError, Harvester, RecordStream};

const FEED_MIME: &str = "application/rss+xml, application/xml;q=0.9, */*;q=0.1";

pub struct RssHarvester {
    source: String,
    url: String,
    lookback: chrono::Duration,
    client: reqwest::Client,
}

/// One `<item>` of a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FeedItem {
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// The item element exactly as it appears in the feed.
    pub xml: String,
}

#[derive(Debug, Clone, Copy)]
enum ItemField {
    Link,
    PubDate,
}

struct OpenItem {
    start: usize,
    depth: usize,
    field: Option<ItemField>,
    link: String,
    pub_date: String,
}

impl RssHarvester {
    pub fn new(source: impl Into<String>, config: &RssConfig) -> Result<Self, HarvestError> {
        Ok(Self {
            source: source.into(),
            url: config.url.clone(),
            lookback: lookback_days(config.lookback_days)?,
            client: http_client(config.request_timeout_secs)?,
        })
    }

    async fn fetch(&self) -> Result<String, HarvestError> {
        info!(url = %self.url, "Fetching feed");

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, FEED_MIME)
            .send()
            .await
            .map_err(|e| HarvestError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        response
            .text()
            .await
            .map_err(|e| HarvestError::Network(e.to_string()))
    }
}

fn xml_error(e: quick_xml::Error) -> HarvestError {
    HarvestError::Parse(format!("malformed feed: {e}"))
}

/// Splits a feed into its items.
pub(crate) fn parse_items(feed: &str) -> Result<Vec<FeedItem>, HarvestError> {
    let mut reader = Reader::from_str(feed);
    let mut items = Vec::new();
    let mut current: Option<OpenItem> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match current.as_mut() {
                Some(item) => {
                    item.depth += 1;
                    if item.depth == 1 {
                        item.field = match e.local_name().as_ref() {
                            b"link" => Some(ItemField::Link),
                            b"pubDate" => Some(ItemField::PubDate),
                            _ => None,
                        };
                    }
                }
                None if e.local_name().as_ref() == b"item" => {
                    // Attribute values cannot hold a raw '<', so the last one
                    // before the reader position opens this tag.
                    let start = feed
                        .get(..reader.buffer_position())
                        .and_then(|head| head.rfind('<'))
                        .ok_or_else(|| HarvestError::Parse("unterminated item tag".to_string()))?;
                    current = Some(OpenItem {
                        start,
                        depth: 0,
                        field: None,
                        link: String::new(),
                        pub_date: String::new(),
                    });
                }
                None => {}
            },
            Event::End(_) => {
                if let Some(mut item) = current.take() {
                    if item.depth == 0 {
                        let xml = feed
                            .get(item.start..reader.buffer_position())
                            .ok_or_else(|| HarvestError::Parse("item out of bounds".to_string()))?;
                        items.push(item.finish(xml));
                    } else {
                        item.depth -= 1;
                        item.field = None;
                        current = Some(item);
                    }
                }
            }
            Event::Text(e) => {
                if let Some(item) = current.as_mut() {
                    let text = e.unescape().map_err(xml_error)?;
                    item.push_text(&text);
                }
            }
            Event::CData(e) => {
                if let Some(item) = current.as_mut() {
                    item.push_text(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if current.is_some() {
        return Err(HarvestError::Parse("feed ended inside an item".to_string()));
    }
    Ok(items)
}

impl OpenItem {
    fn push_text(&mut self, text: &str) {
        match self.field {
            Some(ItemField::Link) => self.link.push_str(text),
            Some(ItemField::PubDate) => self.pub_date.push_str(text),
            None => {}
        }
    }

    fn finish(self, xml: &str) -> FeedItem {
        let link = Some(self.link.trim().to_string()).filter(|link| !link.is_empty());
        let published = match self.pub_date.trim() {
            "" => None,
            date => match DateTime::parse_from_rfc2822(date) {
                Ok(date) => Some(date.with_timezone(&Utc)),
                Err(e) => {
                    debug!(date, error = %e, "Ignoring unparseable pubDate");
                    None
                }
            },
        };

        FeedItem {
            link,
            published,
            xml: xml.to_string(),
        }
    }
}

/// Items of `window`, one record per link.
pub(crate) fn records_in_window(items: Vec<FeedItem>, window: &HarvestWindow) -> Vec<HarvestedRecord> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for item in items {
        let Some(link) = item.link else {
            warn!("Skipping feed item without a link");
            continue;
        };
        if let Some(published) = item.published {
            if published < window.start || published >= window.end {
                continue;
            }
        }
        if seen.insert(link.clone()) {
            records.push(HarvestedRecord::xml(link, item.xml));
        }
    }

    records
}

impl Harvester for RssHarvester {
    fn source(&self) -> &str {
        &self.source
    }

    fn default_lookback(&self) -> chrono::Duration {
        self.lookback
    }

    fn harvest(&self, window: HarvestWindow) -> RecordStream<'_> {
        Box::pin(stream! {
            let feed = match self.fetch().await {
                Ok(feed) => feed,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let items = match parse_items(&feed) {
                Ok(items) => items,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            info!(source = %self.source, items = items.len(), "Parsed feed");
            for record in records_in_window(items, &window) {
                yield Ok(record);
            }
        })
    }
}
