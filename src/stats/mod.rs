//! Statistics and host health acquisition

pub mod aggregator;
pub mod health;
pub mod sqlite;

pub use aggregator::{
    AggregationPolicy, Aggregator, DataSource, DataSourceError, ItemRecord, StatisticsSnapshot,
};
pub use health::{
    HealthProbe, HealthSnapshot, ProbeError, SysinfoProbe, VolumeInfo, VolumeStatus,
};
pub use sqlite::SqliteDataSource;
