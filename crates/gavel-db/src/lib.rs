pub mod config;
pub mod database;
pub mod job_repository;
pub mod opportunity_repository;
pub mod snapshot_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use job_repository::FetchJobRepository;
pub use opportunity_repository::OpportunityRepository;
pub use snapshot_repository::SnapshotRepository;
