//! Harvest module - the two-stage harvest/normalize task pipeline.
//!
//! - **Tasks**: [`run_harvester`] and [`run_normalizer`], one attempt each
//! - **Pagination**: [`PagedSource`] and [`paginate`] for count-then-page upstreams
//! - **Providers**: concrete harvesters under [`providers`]
//! - **Pipeline**: [`pipeline::Pipeline`] wiring tasks to the queue and workers

pub mod paginate;
pub mod pipeline;
pub mod providers;
pub mod tasks;

pub use paginate::{paginate, PagedSource};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use tasks::{
    resolve_window, run_harvester, run_normalizer, HarvestReport, TaskContext, TaskError,
};
