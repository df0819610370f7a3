//! Concrete harvester implementations.
//!
//! - `sparql` - VIVO-style SPARQL endpoints (count query plus paged selects)
//! - `rss` - RSS feeds that only ever serve their most recent items

pub mod rss;
pub mod sparql;

pub use rss::RssHarvester;
pub use sparql::SparqlHarvester;

use crate::traits::HarvestError;

const USER_AGENT: &str = concat!("scholarly-harvester/", env!("CARGO_PKG_VERSION"));

/// Maps a non-success HTTP status onto the retry taxonomy.
pub(crate) fn classify_status(status: u16, message: String) -> HarvestError {
    match status {
        429 => HarvestError::RateLimited,
        500..=599 => HarvestError::Upstream { status, message },
        _ => HarvestError::Rejected { status, message },
    }
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, HarvestError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| HarvestError::Config(e.to_string()))
}

pub(crate) fn lookback_days(days: i64) -> Result<chrono::Duration, HarvestError> {
    chrono::Duration::try_days(days)
        .ok_or_else(|| HarvestError::Config(format!("lookback of {days} days is out of range")))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(429, String::new()), HarvestError::RateLimited));
        assert!(classify_status(503, String::new()).is_retryable());
        assert!(!classify_status(401, String::new()).is_retryable());
    }

    #[test]
    fn test_lookback_out_of_range_is_config_error() {
        assert_eq!(lookback_days(2).unwrap(), chrono::Duration::days(2));
        assert!(matches!(lookback_days(i64::MAX), Err(HarvestError::Config(_))));
    }
}
