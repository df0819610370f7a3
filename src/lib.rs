pub mod config;
pub mod executor;
pub mod harvest;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod queue;
pub mod registry;
pub mod store;
pub mod traits;

// Re-export common types for convenience
pub use config::{
    ConfigError, PipelineConfig, RssConfig, RuntimeConfig, SourceConfig, SparqlConfig,
};
pub use executor::{RetryPolicy, TaskExecutor};
pub use harvest::{
    paginate, run_harvester, run_normalizer, HarvestReport, PagedSource, Pipeline,
    PipelineBuilder, TaskContext, TaskError,
};
pub use ledger::{TaskId, TaskLedger, TaskRecord, TaskState};
pub use model::*;
pub use normalize::{JsonNormalizer, MemoryGraphSink, XmlNormalizer};
pub use queue::{ChannelQueue, QueueError, TaskKind, TaskQueue};
pub use registry::{RegistryError, SourceEntry, SourceRegistry};
pub use store::{MemoryStore, PutOutcome, RawRecordStore, StoreError};
pub use traits::*;
