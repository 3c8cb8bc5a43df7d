pub mod analysis;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod job;
pub mod job_queue;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod rate_governor;
pub mod rotator;
pub mod scheduler;
pub mod traits;
pub mod util;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use analysis::{AnalysisConfig, AnalysisOutcome, AnalysisStage, FlatRateShipping};
pub use config::PipelineConfig;
pub use error::{AppError, ErrorKind, FetchError};
pub use job::{FetchJob, JobState, NewFetchJob};
pub use job_queue::JobQueue;
pub use models::{Fields, ListingKey, ListingRef, ListingSnapshot, OpportunityRecord, Source};
pub use pipeline::{Pipeline, PipelineParts, PipelineStatus};
pub use scheduler::DiscoveryTarget;
pub use traits::{
    DiscoverySource, FetchedPage, ListingParser, OpportunityStore, PageFetcher, ShippingEstimator,
    SnapshotStore, ValuePredictor,
};
