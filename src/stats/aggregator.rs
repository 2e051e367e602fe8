//! Aggregation of scan records into a [`StatisticsSnapshot`]
//!
//! The data source returns raw item records for a window; the aggregator owns
//! the rules that turn them into counters. Aggregation is all-or-nothing: a
//! failed query never yields a partial snapshot.

use crate::config::ConfigParseError;
use crate::protocol::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// One scanned item as stored by the data source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemRecord {
    /// Decoded identifier, or the failed-scan sentinel
    pub identifier: Option<String>,
    pub weight: Option<f64>,
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    /// Number of items detected in a single scan
    pub item_count: Option<u32>,
    pub out_of_spec: bool,
    /// Whether the record was forwarded upstream; `None` when unknown
    pub sent: Option<bool>,
}

impl ItemRecord {
    fn has_weight(&self) -> bool {
        matches!(self.weight, Some(w) if w != 0.0)
    }

    fn has_dimensions(&self) -> bool {
        [self.length, self.width, self.height]
            .iter()
            .all(|dim| matches!(dim, Some(d) if *d != 0.0))
    }

    fn is_no_read(&self, sentinel: &str) -> bool {
        self.identifier.as_deref() == Some(sentinel)
    }

    fn is_good_read(&self, sentinel: &str) -> bool {
        self.identifier.is_some() && !self.is_no_read(sentinel)
    }

    fn has_multiple_items(&self) -> bool {
        self.item_count.is_some_and(|count| count > 1)
    }
}

/// How `success` and `out_of_spec` are derived.
///
/// Both variants have been used by deployed stations and are kept side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// `out_of_spec` counts records flagged out of spec; `success` counts
    /// complete records that are also within spec.
    #[default]
    DirectFlags,
    /// `success` counts complete records (good read, weight, dimensions,
    /// single item); `out_of_spec` is `total_items - success`.
    CompletenessDerived,
}

impl FromStr for AggregationPolicy {
    type Err = ConfigParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "direct_flags" | "v2" => Ok(Self::DirectFlags),
            "completeness_derived" | "v1" => Ok(Self::CompletenessDerived),
            _ => Err(ConfigParseError::new(
                "datasource.policy",
                s,
                "direct_flags | completeness_derived",
            )),
        }
    }
}

/// Counters for one aggregation window. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub total_items: u64,
    pub no_weight: u64,
    pub no_dimensions: u64,
    pub good_reads: u64,
    pub no_reads: u64,
    pub out_of_spec: u64,
    pub more_than_one_item: u64,
    pub sent: u64,
    pub not_sent: u64,
    pub success: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl StatisticsSnapshot {
    /// `sent + not_sent == total_items`. Expected for well-formed data but not guaranteed.
    pub fn transmission_balanced(&self) -> bool {
        self.sent + self.not_sent == self.total_items
    }

    /// Shape raw records into counters
    pub fn from_records(
        records: &[ItemRecord],
        policy: AggregationPolicy,
        no_read_sentinel: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        let complete = |record: &ItemRecord| {
            record.is_good_read(no_read_sentinel)
                && record.has_weight()
                && record.has_dimensions()
                && !record.has_multiple_items()
        };

        let total_items = records.len() as u64;
        let (success, out_of_spec) = match policy {
            AggregationPolicy::DirectFlags => (
                count(records, |r| complete(r) && !r.out_of_spec),
                count(records, |r| r.out_of_spec),
            ),
            AggregationPolicy::CompletenessDerived => {
                let success = count(records, complete);
                (success, total_items - success)
            }
        };

        Self {
            total_items,
            no_weight: count(records, |r| !r.has_weight()),
            no_dimensions: count(records, |r| !r.has_dimensions()),
            good_reads: count(records, |r| r.is_good_read(no_read_sentinel)),
            no_reads: count(records, |r| r.is_no_read(no_read_sentinel)),
            out_of_spec,
            more_than_one_item: count(records, ItemRecord::has_multiple_items),
            sent: count(records, |r| r.sent == Some(true)),
            not_sent: count(records, |r| r.sent == Some(false)),
            success,
            window_start,
            window_end,
        }
    }
}

fn count(records: &[ItemRecord], predicate: impl Fn(&ItemRecord) -> bool) -> u64 {
    records.iter().filter(|&record| predicate(record)).count() as u64
}

/// Failures of the underlying data source
#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("Data source unavailable: {0}")]
    Unavailable(String),
    #[error("Aggregation query failed: {0}")]
    Query(String),
    #[error("Aggregation query timed out after {0:?}")]
    Timeout(Duration),
    #[error("Malformed row: {0}")]
    MalformedRow(String),
    #[error("Invalid aggregation window: {0:?}")]
    InvalidWindow(Duration),
}

/// Query engine holding the scan records
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Return every record in `[window_start, window_end)`
    async fn run_aggregation_query(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<ItemRecord>, DataSourceError>;
}

pub struct Aggregator {
    source: Arc<dyn DataSource>,
    policy: AggregationPolicy,
    no_read_sentinel: String,
    clock: Arc<dyn Clock>,
}

impl Aggregator {
    pub fn new(
        source: Arc<dyn DataSource>,
        policy: AggregationPolicy,
        no_read_sentinel: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            policy,
            no_read_sentinel: no_read_sentinel.into(),
            clock,
        }
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Aggregate the window `[now - window, now)`, computed at call time
    pub async fn aggregate(&self, window: Duration) -> Result<StatisticsSnapshot, DataSourceError> {
        let span = chrono::Duration::from_std(window)
            .ok()
            .filter(|span| *span > chrono::Duration::zero())
            .ok_or(DataSourceError::InvalidWindow(window))?;

        let window_end = self.clock.now();
        let window_start = window_end
            .checked_sub_signed(span)
            .ok_or(DataSourceError::InvalidWindow(window))?;

        let records = self
            .source
            .run_aggregation_query(window_start, window_end)
            .await?;

        let snapshot = StatisticsSnapshot::from_records(
            &records,
            self.policy,
            &self.no_read_sentinel,
            window_start,
            window_end,
        );

        if !snapshot.transmission_balanced() {
            warn!(
                total_items = snapshot.total_items,
                sent = snapshot.sent,
                not_sent = snapshot.not_sent,
                window_start = %snapshot.window_start,
                window_end = %snapshot.window_end,
                "sent + not_sent does not match total_items"
            );
        }

        debug!(
            total_items = snapshot.total_items,
            policy = ?self.policy,
            "Aggregated statistics window"
        );
        Ok(snapshot)
    }
}
