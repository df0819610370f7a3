//! Static mapping from source identifier to its harvester and normalizer.
//!
//! Built once at startup and shared read-only by every task.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{PipelineConfig, SourceConfig};
use crate::harvest::providers::{RssHarvester, SparqlHarvester};
use crate::normalize::{JsonNormalizer, XmlNormalizer};
use crate::traits::{HarvestError, Harvester, Normalizer};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Source '{0}' is registered twice")]
    Duplicate(String),
    #[error("Failed to build harvester for '{source_name}': {error}")]
    Harvester {
        source_name: String,
        error: HarvestError,
    },
}

#[derive(Clone)]
pub struct SourceEntry {
    pub harvester: Arc<dyn Harvester>,
    pub normalizer: Arc<dyn Normalizer>,
}

#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, SourceEntry>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one entry per configured source.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, RegistryError> {
        let mut registry = Self::new();

        for (name, source) in &config.sources {
            let harvester_error = |error: HarvestError| RegistryError::Harvester {
                source_name: name.clone(),
                error,
            };
            let (harvester, normalizer) = match source {
                SourceConfig::Sparql(sparql) => (
                    Arc::new(SparqlHarvester::new(name.clone(), sparql).map_err(harvester_error)?)
                        as Arc<dyn Harvester>,
                    Arc::new(JsonNormalizer) as Arc<dyn Normalizer>,
                ),
                SourceConfig::Rss(rss) => (
                    Arc::new(RssHarvester::new(name.clone(), rss).map_err(harvester_error)?)
                        as Arc<dyn Harvester>,
                    Arc::new(XmlNormalizer) as Arc<dyn Normalizer>,
                ),
            };
            registry = registry.register(harvester, normalizer)?;
        }

        Ok(registry)
    }

    /// Registers a pair under the harvester's source identifier.
    pub fn register(
        mut self,
        harvester: Arc<dyn Harvester>,
        normalizer: Arc<dyn Normalizer>,
    ) -> Result<Self, RegistryError> {
        let source = harvester.source().to_string();
        if self.sources.contains_key(&source) {
            return Err(RegistryError::Duplicate(source));
        }
        self.sources.insert(
            source,
            SourceEntry {
                harvester,
                normalizer,
            },
        );
        Ok(self)
    }

    pub fn get(&self, source: &str) -> Option<&SourceEntry> {
        self.sources.get(source)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
